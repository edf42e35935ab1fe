use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::endpoint::{ClientCertPolicyError, HandshakeFailure, HandshakeProbe};
use crate::trust::VerificationError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Policy(#[from] ClientCertPolicyError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("request to '{url}' failed: {source}")]
    RequestFailed {
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("can't read response from '{url}': {source}")]
    ResponseReadFailed {
        url: String,
        #[source]
        source: hyper::Error,
    },
    #[error("request to '{url}' timed out after {timeout:?}")]
    TimedOut { url: String, timeout: Duration },
}

/// Errors from `ping`, which is a bare round trip.
pub type PingError = TransportError;

impl From<HandshakeFailure> for TransportError {
    fn from(failure: HandshakeFailure) -> Self {
        match failure {
            HandshakeFailure::Verification(e) => TransportError::Verification(e),
            HandshakeFailure::Policy(e) => TransportError::Policy(e),
        }
    }
}

pub(crate) fn request_failed(url: &str, source: impl Into<BoxError>) -> TransportError {
    TransportError::RequestFailed {
        url: url.to_string(),
        source: source.into(),
    }
}

/// `host:port` as it goes into a URL or Host header; IPv6 literals are bracketed.
pub fn authority(host: &str, port: u16) -> String {
    match host.parse::<Ipv6Addr>() {
        Ok(addr) => format!("[{}]:{}", addr, port),
        Err(_) => format!("{}:{}", host, port),
    }
}

/// Status and body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResponse {
    pub status: StatusCode,
    pub body: String,
}

impl DeviceResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Send `request` to `host:port` over TLS.
///
/// Anything the handshake callbacks recorded wins over the transport error,
/// and aborts the call before a single HTTP byte is written.
pub async fn https_exchange(
    host: &str,
    port: u16,
    config: ClientConfig,
    probe: &HandshakeProbe,
    request: Request<Full<Bytes>>,
    timeout: Duration,
) -> Result<DeviceResponse, TransportError> {
    let url = format!("https://{}{}", authority(host, port), request.uri());

    let round_trip = async {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| request_failed(&url, e))?;
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|e| request_failed(&url, e))?;

        let handshake = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await;
        if let Some(failure) = probe.take_failure() {
            return Err(failure.into());
        }
        let tls = handshake.map_err(|e| request_failed(&url, e))?;
        debug!("TLS session established with {}:{}", host, port);

        exchange(&url, tls, request).await
    };

    tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| TransportError::TimedOut {
            url: url.clone(),
            timeout,
        })?
}

/// Send `request` to `hostport` over plain TCP.
pub async fn http_exchange(
    hostport: &str,
    request: Request<Full<Bytes>>,
    timeout: Duration,
) -> Result<DeviceResponse, TransportError> {
    let url = format!("http://{}{}", hostport, request.uri());

    let round_trip = async {
        let tcp = TcpStream::connect(hostport)
            .await
            .map_err(|e| request_failed(&url, e))?;
        exchange(&url, tcp, request).await
    };

    tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| TransportError::TimedOut {
            url: url.clone(),
            timeout,
        })?
}

// Bodies are text; invalid UTF-8 is replaced with U+FFFD rather than failing the call.
fn body_text(url: &str, body: Bytes) -> String {
    match String::from_utf8(body.to_vec()) {
        Ok(text) => text,
        Err(e) => {
            debug!(
                "Response from '{}' is not valid UTF-8 ({}), replacing invalid bytes",
                url,
                e.utf8_error()
            );
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}

async fn exchange<T>(
    url: &str,
    io: T,
    request: Request<Full<Bytes>>,
) -> Result<DeviceResponse, TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| request_failed(url, e))?;

    let response = async {
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| request_failed(url, e))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|source| TransportError::ResponseReadFailed {
                url: url.to_string(),
                source,
            })?
            .to_bytes();
        Ok::<_, TransportError>(DeviceResponse {
            status,
            body: body_text(url, body),
        })
    };
    tokio::pin!(response);
    tokio::pin!(conn);

    // The connection is driven here rather than spawned, so it is dropped
    // together with this future.
    tokio::select! {
        result = &mut response => result,
        closed = &mut conn => match closed {
            Ok(()) => response.await,
            Err(e) => Err(request_failed(url, e)),
        },
    }
}
