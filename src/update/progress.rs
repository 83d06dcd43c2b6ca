//! Transfer accounting and the progress reporter.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const REPORT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct SessionInner {
    total: AtomicU64,
    transferred: AtomicU64,
    started: Mutex<Instant>,
}

/// Byte counters of the transfer in flight.
///
/// Clones share the same counters, so the reporter can read what the
/// transfer writes. [`TransferSession::begin`] resets them.
#[derive(Debug, Clone)]
pub struct TransferSession {
    inner: Arc<SessionInner>,
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferSession {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                total: AtomicU64::new(0),
                transferred: AtomicU64::new(0),
                started: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Start a new transfer of `total` bytes (`None` when unknown).
    pub fn begin(&self, total: Option<u64>) {
        self.inner.total.store(total.unwrap_or(0), Ordering::SeqCst);
        self.inner.transferred.store(0, Ordering::SeqCst);
        *self.inner.started.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn add(&self, n: u64) {
        self.inner.transferred.fetch_add(n, Ordering::SeqCst);
    }

    pub fn transferred(&self) -> u64 {
        self.inner.transferred.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> Option<u64> {
        match self.inner.total.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.inner
            .started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Bytes per second since [`TransferSession::begin`].
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.transferred() as f64 / secs
    }

    /// One progress line, e.g. `12.0 MiB/50.0 MiB (24%) 3.1 MiB/s 4.0s`.
    pub fn display(&self) -> String {
        let done = self.transferred();
        let mut line = match self.total() {
            Some(total) => format!(
                "{}/{} ({}%)",
                format_bytes(done),
                format_bytes(total),
                (done.min(total) * 100) / total
            ),
            None => format_bytes(done),
        };
        line.push_str(&format!(
            " {}/s {}",
            format_bytes(self.throughput() as u64),
            crate::timing::format_duration(self.elapsed())
        ));
        line
    }
}

pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if n < 1024 {
        return format!("{} B", n);
    }
    let mut value = n as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Sending half of a [`CancelSignal`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation of a transfer and everything tied to it.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // sender gone without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Background task printing the progress of one transfer.
///
/// [`Reporter::stop`] must be awaited before anything else is printed.
pub struct Reporter {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reporter {
    /// Report to stdout.
    pub fn spawn(session: TransferSession, status: impl Into<String>, cancel: CancelSignal) -> Self {
        Self::spawn_to(session, status, cancel, std::io::stdout())
    }

    pub fn spawn_to<W>(
        session: TransferSession,
        status: impl Into<String>,
        cancel: CancelSignal,
        mut out: W,
    ) -> Self
    where
        W: Write + Send + 'static,
    {
        let status = status.into();
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPORT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = write!(out, "\r{}: {}", status, session.display());
                        let _ = out.flush();
                    }
                    _ = stop_rx.changed() => break,
                    _ = cancel.cancelled() => break,
                }
            }
            let _ = writeln!(out, "\r{}: {}", status, session.display());
            let _ = out.flush();
        });
        Self { stop, handle }
    }

    /// Stop reporting and wait for the final line to be written.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.handle.await {
            log::warn!("progress reporter failed: {}", e);
        }
    }
}
