//! A single `go build` invocation.

use super::{BuildError, BuildRequest, BuiltBinary};
use crate::config::WorkingConfig;
use crate::process::Cmd;
use crate::sbom::build_dir_for;
use std::path::PathBuf;

/// Flags that keep the output independent of the build host and time.
const REPRODUCIBLE_FLAGS: &[&str] = &["-trimpath", "-buildvcs=false", "-ldflags=-buildid="];

/// The `go build` command line for one package.
pub fn go_build_command(
    cfg: &WorkingConfig,
    req: &BuildRequest,
    package: &str,
    output: &std::path::Path,
) -> Cmd {
    let mut cmd = Cmd::new(cfg.internal.go.as_os_str())
        .arg("build")
        .arg("-o")
        .arg_path(output)
        .args(REPRODUCIBLE_FLAGS.iter().copied());
    if let Some(tags) = req.tags.get(package) {
        if !tags.is_empty() {
            cmd = cmd.arg(format!("-tags={}", tags.join(",")));
        }
    }
    if let Some(flags) = req.flags.get(package) {
        cmd = cmd.args(flags.iter());
    }
    cmd.arg(package)
        .dir(&build_dir_for(&cfg.builddir, package))
        .env("GOOS", "linux")
        .env("GOARCH", &cfg.internal.goarch)
        .env("CGO_ENABLED", "0")
        .allow_fail()
}

pub struct CompileJob {
    package: String,
    name: String,
    output: PathBuf,
    cmd: Cmd,
}

impl CompileJob {
    pub fn new(cfg: &WorkingConfig, req: &BuildRequest, package: &str, output: PathBuf) -> Self {
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            package: package.to_string(),
            name,
            cmd: go_build_command(cfg, req, package, &output),
            output,
        }
    }

    pub async fn run(self) -> Result<BuiltBinary, BuildError> {
        log::debug!("compiling {}", self.package);
        let result = self.cmd.output().await?;
        if !result.success() {
            return Err(BuildError::Compile {
                package: self.package,
                diagnostic: result.stderr,
            });
        }
        if !self.output.is_file() {
            return Err(BuildError::NotInstalled {
                package: self.package,
                path: self.output,
            });
        }
        Ok(BuiltBinary {
            package: self.package,
            name: self.name,
            path: self.output,
            prebuilt: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use std::path::Path;

    #[test]
    fn test_command_line() {
        let mut cfg = WorkingConfig::new(BuildConfig::new("h"), PathBuf::from("/b"));
        cfg.internal.go = PathBuf::from("go");
        cfg.internal.goarch = "arm64".into();
        let mut req = BuildRequest::default();
        req.tags.insert("a.org/cmd/x".into(), vec!["netgo".into(), "osusergo".into()]);
        req.flags.insert("a.org/cmd/x".into(), vec!["-v".into()]);

        let shown = go_build_command(&cfg, &req, "a.org/cmd/x", Path::new("/out/x")).display();
        assert_eq!(
            shown,
            "go build -o /out/x -trimpath -buildvcs=false -ldflags=-buildid= \
             -tags=netgo,osusergo -v a.org/cmd/x"
        );
    }
}
