use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Endpoint;

/// Upper bound for any single exchange with the endpoint.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("link down")]
    Disconnected,
    #[error("timed out")]
    Timeout,
    #[error("http: {0}")]
    Http(String),
}

/// Raw result of one request: status code and undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Byte-oriented request/response link to the collection endpoint.
///
/// Implementations bound every call with a timeout; a timeout is reported
/// as an error, never as a hang.
pub trait Transport: Send + Sync {
    /// Cheap link check used to gate each cycle.
    fn is_connected(&self, endpoint: &Endpoint) -> impl Future<Output = bool> + Send;

    /// Try to bring the link back after a failed link check.
    fn reconnect(&self, endpoint: &Endpoint) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// POST `body` to `path` and return whatever came back.
    fn post(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

/// HTTP/1.1 transport over plain TCP.
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

impl Transport for HttpTransport {
    async fn is_connected(&self, endpoint: &Endpoint) -> bool {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)))
    }

    async fn reconnect(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        // Nothing is held open between requests, so reconnecting is another link check.
        if self.is_connected(endpoint).await {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    async fn post(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: Vec<u8>,
    ) -> Result<TransportResponse, TransportError> {
        let url = endpoint.url(path);
        debug!("POST {} ({} bytes)", url, body.len());

        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(map_reqwest_error)?.to_vec();
        debug!("POST {} -> {} ({} bytes)", url, status, body.len());

        Ok(TransportResponse { status, body })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Disconnected
    } else {
        TransportError::Http(e.to_string())
    }
}
