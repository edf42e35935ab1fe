use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use serde::Serialize;
use tracing::{debug, info};

use crate::endpoint::{client_config, ClientCertPolicyError, EndpointMode};
use crate::identity::{CertificateEncoding, ClientIdentity};
use crate::transport::{
    authority, https_exchange, request_failed, DeviceResponse, PingError, TransportError,
    DEFAULT_TIMEOUT,
};
use crate::trust::TrustAnchor;

pub const PUBLIC_PORT: u16 = 8446;
pub const CLIENT_MGMT_PORT: u16 = 8443;
pub const API_PORT: u16 = 8444;

const PUBLIC_INFORMATION_PATH: &str = "/smarthome/public/information";
const CLIENTS_PATH: &str = "/smarthome/clients";
const SYSTEM_PASSWORD_HEADER: HeaderName = HeaderName::from_static("systempassword");

const CLIENT_TYPE: &str = "client";
const CLIENT_ID: &str = "oss_shc_ems_syncer";
const CLIENT_NAME: &str = "OSS SHC EMS Syncer";
const CLIENT_ROLE: &str = "ROLE_RESTRICTED_CLIENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePorts {
    pub public: u16,
    pub client_mgmt: u16,
    pub api: u16,
}

impl Default for DevicePorts {
    fn default() -> Self {
        Self {
            public: PUBLIC_PORT,
            client_mgmt: CLIENT_MGMT_PORT,
            api: API_PORT,
        }
    }
}

/// Where the controller is and which CA vouches for it.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub host: String,
    pub ports: DevicePorts,
    pub trust: TrustAnchor,
}

/// Body of `POST /smarthome/clients`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    #[serde(rename = "type")]
    pub client_type: String,
    pub id: String,
    pub name: String,
    pub primary_role: String,
    pub certificate: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub status: StatusCode,
    /// Whatever the controller said, if it said anything.
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("no client certificate configured; registration enrolls the configured client certificate")]
    MissingClientIdentity,
    #[error("can't encode register request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("'register' request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("SHC register request failed with '{status}' - body: {body}")]
    RegistrationRejected { status: StatusCode, body: String },
}

pub struct ShcClient {
    device: DeviceIdentity,
    identity: Option<ClientIdentity>,
    encoding: CertificateEncoding,
    timeout: Duration,
}

impl ShcClient {
    pub fn new(device: DeviceIdentity, identity: Option<ClientIdentity>) -> Self {
        Self {
            device,
            identity,
            encoding: CertificateEncoding::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_certificate_encoding(mut self, encoding: CertificateEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch the unauthenticated information document. One attempt, no retries.
    pub async fn ping(&self) -> Result<String, PingError> {
        let request = self.request(
            Method::GET,
            self.device.ports.public,
            PUBLIC_INFORMATION_PATH,
            None,
            Bytes::new(),
        )?;
        let response = self
            .send(EndpointMode::PublicNoAuth, self.device.ports.public, request)
            .await?;
        Ok(response.body)
    }

    /// Enroll this client's certificate with the controller.
    ///
    /// Only succeeds while the controller is in pairing mode, i.e. shortly
    /// after its pairing button was pressed. Never retried.
    pub async fn register(&self, system_password: &str) -> Result<RegistrationResult, RegisterError> {
        let body = serde_json::to_vec(&self.registration_request()?)?;
        debug!("Register request body: {}", String::from_utf8_lossy(&body));

        let port = self.device.ports.client_mgmt;
        let mut request = self.request(
            Method::POST,
            port,
            CLIENTS_PATH,
            Some("application/json"),
            Bytes::from(body),
        )?;
        let password = STANDARD.encode(system_password.as_bytes());
        request.headers_mut().insert(
            SYSTEM_PASSWORD_HEADER,
            HeaderValue::from_str(&password)
                .map_err(|e| request_failed(&self.url(port, CLIENTS_PATH), e))?,
        );

        info!("Registering client '{}' with SHC at {}", CLIENT_ID, self.device.host);
        let response = self
            .send(EndpointMode::RegistrationNoAuth, port, request)
            .await?;
        if !response.is_success() {
            return Err(RegisterError::RegistrationRejected {
                status: response.status,
                body: response.body,
            });
        }

        Ok(RegistrationResult {
            status: response.status,
            message: Some(response.body).filter(|m| !m.is_empty()),
        })
    }

    /// GET `/smarthome/{path}` on the mutual-TLS API port.
    pub async fn get(&self, path: &str) -> Result<DeviceResponse, TransportError> {
        if self.identity.is_none() {
            return Err(ClientCertPolicyError::NoClientIdentity.into());
        }
        let path = format!("/smarthome/{}", path.trim_start_matches('/'));
        let port = self.device.ports.api;
        let request = self.request(Method::GET, port, &path, None, Bytes::new())?;
        self.send(EndpointMode::OperationalMutualAuth, port, request)
            .await
    }

    pub fn registration_request(&self) -> Result<RegistrationRequest, RegisterError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or(RegisterError::MissingClientIdentity)?;
        Ok(RegistrationRequest {
            client_type: CLIENT_TYPE.to_string(),
            id: CLIENT_ID.to_string(),
            name: CLIENT_NAME.to_string(),
            primary_role: CLIENT_ROLE.to_string(),
            certificate: self.encoding.encode(identity.leaf().as_ref()),
        })
    }

    fn request(
        &self,
        method: Method,
        port: u16,
        path: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<Request<Full<Bytes>>, TransportError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, authority(&self.device.host, port));
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        builder
            .body(Full::new(body))
            .map_err(|e| request_failed(&self.url(port, path), e))
    }

    async fn send(
        &self,
        mode: EndpointMode,
        port: u16,
        request: Request<Full<Bytes>>,
    ) -> Result<DeviceResponse, TransportError> {
        let url = self.url(port, request.uri().path());
        let (config, probe) = client_config(mode, &self.device.trust, self.identity.as_ref())
            .map_err(|e| request_failed(&url, e))?;
        https_exchange(
            &self.device.host,
            port,
            config,
            &probe,
            request,
            self.timeout,
        )
        .await
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("https://{}{}", authority(&self.device.host, port), path)
    }
}
