use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use x509_parser::prelude::*;

use crate::identity::ClientIdentity;
use crate::trust::{crypto_provider, TrustAnchor};

pub struct TestCa {
    pub cert: Certificate,
    key: KeyPair,
}

pub struct TestLeaf {
    pub cert: Certificate,
    pub key: KeyPair,
}

/// How the mock controller asks for client certificates.
pub enum ClientAuth<'a> {
    /// CertificateRequest sent, empty answer accepted.
    Optional(&'a TestCa),
    /// CertificateRequest sent, a certificate from this CA is mandatory.
    Required(&'a TestCa),
}

fn ca_params(name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

fn leaf_params(sans: &[&str]) -> CertificateParams {
    let sans: Vec<String> = sans.iter().map(|s| s.to_string()).collect();
    let mut params = CertificateParams::new(sans).unwrap();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "Bosch SHC test device");
    params
}

impl TestCa {
    pub fn root(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let cert = ca_params(name).self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn intermediate(&self, name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let cert = ca_params(name)
            .signed_by(&key, &self.cert, &self.key)
            .unwrap();
        Self { cert, key }
    }

    pub fn leaf(&self, sans: &[&str]) -> TestLeaf {
        self.issue(leaf_params(sans))
    }

    pub fn expired_leaf(&self) -> TestLeaf {
        let mut params = leaf_params(&[]);
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        self.issue(params)
    }

    fn issue(&self, params: CertificateParams) -> TestLeaf {
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        TestLeaf { cert, key }
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    pub fn anchor(&self) -> TrustAnchor {
        TrustAnchor::from_certs([self.der()]).unwrap()
    }

    /// Raw DER subject name, as sent in CertificateRequest CA hints.
    pub fn subject_der(&self) -> Vec<u8> {
        let (_, parsed) = X509Certificate::from_der(self.cert.der().as_ref()).unwrap();
        parsed.subject().as_raw().to_vec()
    }

    /// Server config for a mock controller whose certificate this CA issued.
    /// The certificate carries no names at all.
    pub fn server_config(&self, client_auth: Option<ClientAuth<'_>>) -> ServerConfig {
        let leaf = self.leaf(&[]);
        let provider = crypto_provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap();

        let builder = match client_auth {
            None => builder.with_no_client_auth(),
            Some(auth) => {
                let (ca, optional) = match auth {
                    ClientAuth::Optional(ca) => (ca, true),
                    ClientAuth::Required(ca) => (ca, false),
                };
                let mut roots = RootCertStore::empty();
                roots.add(ca.der()).unwrap();
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
                let verifier = if optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                builder.with_client_cert_verifier(verifier.build().unwrap())
            }
        };

        builder
            .with_single_cert(vec![leaf.der()], leaf.private_key())
            .unwrap()
    }
}

impl TestLeaf {
    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key.serialize_der()).into()
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(vec![self.der()], self.private_key()).unwrap()
    }
}

pub fn get_request(authority: &str, path: &str) -> Request<Full<Bytes>> {
    Request::get(path)
        .header(HOST, authority)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

struct DeviceState {
    status: StatusCode,
    body: String,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// A one-route HTTP(S) server answering every request with a fixed status and body.
pub struct MockDevice {
    addr: SocketAddr,
    state: Arc<DeviceState>,
    task: JoinHandle<()>,
}

impl MockDevice {
    pub async fn plain(status: u16, body: &str) -> Self {
        Self::start("127.0.0.1:0", None, status, body).await
    }

    pub async fn tls(config: ServerConfig, status: u16, body: &str) -> Self {
        Self::tls_on("127.0.0.1:0", config, status, body).await
    }

    pub async fn tls_on(bind: &str, config: ServerConfig, status: u16, body: &str) -> Self {
        Self::start(bind, Some(TlsAcceptor::from(Arc::new(config))), status, body).await
    }

    async fn start(bind: &str, acceptor: Option<TlsAcceptor>, status: u16, body: &str) -> Self {
        let listener = TcpListener::bind(bind).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(DeviceState {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
            requests: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let state = accept_state.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        None => serve(TokioIo::new(tcp), state, Vec::new()).await,
                        Some(acceptor) => {
                            let Ok(tls) = acceptor.accept(tcp).await else {
                                return;
                            };
                            let peer = tls
                                .get_ref()
                                .1
                                .peer_certificates()
                                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                                .unwrap_or_default();
                            serve(TokioIo::new(tls), state, peer).await
                        }
                    }
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<I>(io: I, state: Arc<DeviceState>, peer: Vec<CertificateDer<'static>>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let peer = peer.clone();
        async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let headers = req.headers().clone();
            let body = req.into_body().collect().await?.to_bytes();
            state.requests.lock().unwrap().push(RecordedRequest {
                method,
                path,
                headers,
                body: String::from_utf8_lossy(&body).into_owned(),
                peer_certificates: peer,
            });
            Ok::<_, hyper::Error>(
                Response::builder()
                    .status(state.status)
                    .body(Full::new(Bytes::from(state.body.clone())))
                    .unwrap(),
            )
        }
    });

    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await;
}
