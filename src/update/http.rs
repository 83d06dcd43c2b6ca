//! [`Transport`] over HTTP.

use super::protocol::{self, Features};
use super::{Transport, Upload, UpdateError};
use crate::config::UpdateEndpoint;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};

fn transfer_error(path: &str, e: reqwest::Error) -> UpdateError {
    UpdateError::Transfer {
        path: path.to_string(),
        source: Box::new(e),
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    user: String,
    password: Option<String>,
}

impl HttpTransport {
    /// `password` is sent as given; `base_url` must not carry credentials.
    pub fn new(base_url: &str, password: Option<&str>, client: Client) -> Result<Self, UpdateError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| UpdateError::Protocol(format!("invalid update URL: {}", e)))?;
        if !base.username().is_empty() || base.password().is_some() {
            return Err(UpdateError::Protocol(
                "update URL must not embed credentials; pass the password separately".into(),
            ));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client,
            base,
            user: protocol::USER.to_string(),
            password: password.map(str::to_string),
        })
    }

    pub fn from_endpoint(endpoint: &UpdateEndpoint, client: Client) -> Result<Self, UpdateError> {
        Self::new(&endpoint.base_url(), Some(&endpoint.password), client)
    }

    /// Base URL without credentials.
    pub fn base(&self) -> &Url {
        &self.base
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder, UpdateError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| UpdateError::Protocol(format!("invalid path {}: {}", path, e)))?;
        Ok(self
            .client
            .request(method, url)
            .basic_auth(&self.user, self.password.as_deref()))
    }

    async fn send(&self, path: &str, req: RequestBuilder) -> Result<Response, UpdateError> {
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() {
                UpdateError::Connect {
                    url: self.base.to_string(),
                    source: Box::new(e),
                }
            } else {
                transfer_error(path, e)
            }
        })?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default().trim().to_string();
        Err(UpdateError::Status {
            path: path.to_string(),
            status,
            body,
        })
    }
}

impl Transport for HttpTransport {
    async fn features(&self) -> Result<Features, UpdateError> {
        let path = protocol::FEATURES_PATH;
        let req = self.request(reqwest::Method::GET, path)?;
        let resp = match self.send(path, req).await {
            Err(UpdateError::Status { status: 404, .. }) => {
                return Err(UpdateError::Protocol(
                    "instance has no update API (update/features not found)".into(),
                ))
            }
            other => other?,
        };
        let body = resp.bytes().await.map_err(|e| transfer_error(path, e))?;
        serde_json::from_slice(&body)
            .map_err(|e| UpdateError::Protocol(format!("malformed feature list: {}", e)))
    }

    async fn put(&self, path: &str, body: Upload) -> Result<Vec<u8>, UpdateError> {
        let mut req = self.request(reqwest::Method::PUT, path)?;
        if let Some(len) = body.len() {
            req = req.header(reqwest::header::CONTENT_LENGTH, len);
        }
        let req = req.body(reqwest::Body::wrap_stream(body.into_stream()));
        let resp = self.send(path, req).await?;
        let written = resp.bytes().await.map_err(|e| transfer_error(path, e))?;
        Ok(written.to_vec())
    }

    async fn divert(&self, service_path: &str, staged_name: &str) -> Result<(), UpdateError> {
        let path = protocol::DIVERT_PATH;
        let req = self
            .request(reqwest::Method::POST, path)?
            .form(&[("path", service_path), ("diversion", staged_name)]);
        match self.send(path, req).await {
            Ok(_) => Ok(()),
            Err(UpdateError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(UpdateError::UnknownService(service_path.to_string()))
            }
            Err(UpdateError::Status { status, .. })
                if status == StatusCode::PRECONDITION_FAILED.as_u16() =>
            {
                Err(UpdateError::NotStaged(staged_name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn post(&self, path: &str) -> Result<(), UpdateError> {
        let req = self.request(reqwest::Method::POST, path)?;
        self.send(path, req).await.map(|_| ())
    }
}
