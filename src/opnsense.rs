//! OPNsense management API client.
//!
//! Authenticated JSON over HTTPS. The appliance usually runs with a
//! self-signed certificate, so verification is off unless requested.
//! Callers own retry policy; every call here is a single attempt.
use hyper::{client::HttpConnector, header, Body, Method, Request, Uri};
use hyper_openssl::HttpsConnector;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use serde_json::Value;
use thiserror::Error;

/// An appliance object as returned by the `search_*` endpoints.
/// Objects that exist on the appliance carry an opaque `uuid` field.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} must be set")]
    MissingEnv(&'static str),

    #[error("failed to create TLS connector: {0}")]
    CreateTlsConnector(#[source] openssl::error::ErrorStack),

    #[error("invalid request URI {uri}: {source}")]
    InvalidUri {
        uri: String,
        source: hyper::http::uri::InvalidUri,
    },

    #[error("failed to build request: {0}")]
    BuildRequest(#[source] hyper::http::Error),

    #[error("failed to serialize request body: {0}")]
    SerializeBody(#[source] serde_json::Error),

    #[error("request to {path} failed: {source}")]
    Request { path: String, source: hyper::Error },

    #[error("failed to read response from {path}: {source}")]
    ReadResponse { path: String, source: hyper::Error },

    #[error("{path} returned {status}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },

    #[error("failed to parse response from {path}: {source}")]
    ParseResponse {
        path: String,
        source: serde_json::Error,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Cheap to clone handle to the appliance API.
#[derive(Clone)]
pub struct OpnsenseClient {
    http: hyper::Client<HttpsConnector<HttpConnector>>,
    base_url: String,
    auth: String,
}

impl OpnsenseClient {
    /// Build a client for the appliance at `base_url`, authenticating every
    /// request with the static `(key, secret)` credential pair.
    pub fn new(base_url: &str, key: &str, secret: &str, verify_tls: bool) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        let mut ssl = SslConnector::builder(SslMethod::tls()).map_err(Error::CreateTlsConnector)?;
        if !verify_tls {
            ssl.set_verify(SslVerifyMode::NONE);
        }
        let https =
            HttpsConnector::with_connector(connector, ssl).map_err(Error::CreateTlsConnector)?;

        Ok(Self {
            http: hyper::Client::builder().build(https),
            base_url: base_url.trim_end_matches('/').to_owned(),
            auth: format!("Basic {}", base64::encode(format!("{}:{}", key, secret))),
        })
    }

    /// Build a client from `OPNSENSE_URL`, `OPNSENSE_API_KEY` and
    /// `OPNSENSE_API_SECRET`. Certificate verification is off unless
    /// `OPNSENSE_TLS_VERIFY` is `true` or `1`.
    pub fn from_env() -> Result<Self> {
        let base_url = require_env("OPNSENSE_URL")?;
        let key = require_env("OPNSENSE_API_KEY")?;
        let secret = require_env("OPNSENSE_API_SECRET")?;
        let verify_tls = std::env::var("OPNSENSE_TLS_VERIFY")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self::new(&base_url, &key, &secret, verify_tls)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.request(Method::POST, path, body).await
    }

    pub async fn put(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.request(Method::PUT, path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None).await
    }

    /// GET a `search_*` endpoint and project the `rows` array.
    /// A response without `rows` yields an empty list.
    pub async fn search_rows(&self, path: &str) -> Result<Vec<Record>> {
        let response = self.get(path).await?;
        let rows = response
            .get("rows")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.as_object().cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let uri = url.parse::<Uri>().map_err(|source| Error::InvalidUri {
            uri: url,
            source,
        })?;

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, &self.auth)
            .header(header::ACCEPT, "application/json");
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json).map_err(Error::SerializeBody)?,
                )),
            None => builder.body(Body::empty()),
        }
        .map_err(Error::BuildRequest)?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|source| Error::Request {
                path: path.to_owned(),
                source,
            })?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|source| Error::ReadResponse {
                path: path.to_owned(),
                source,
            })?;

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                path: path.to_owned(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|source| Error::ParseResponse {
            path: path.to_owned(),
            source,
        })
    }
}

fn require_env(var: &'static str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::MissingEnv(var)),
    }
}
