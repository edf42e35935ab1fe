use std::io::BufReader;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};
use x509_parser::prelude::*;

/// Crypto provider shared by every TLS configuration in the process.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum VerificationError {
    #[error("no certificates presented")]
    NoCertificatePresented,
    #[error("can't parse certificate at chain position {index}: {reason}")]
    MalformedCertificate { index: usize, reason: String },
    #[error("server cert verification failed: {0}")]
    ChainVerificationFailed(rustls::Error),
}

impl From<&VerificationError> for rustls::Error {
    fn from(err: &VerificationError) -> Self {
        match err {
            VerificationError::NoCertificatePresented => rustls::Error::NoCertificatesPresented,
            VerificationError::MalformedCertificate { .. } => {
                rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
            }
            VerificationError::ChainVerificationFailed(inner) => inner.clone(),
        }
    }
}

/// The pinned root CA set. Loaded once, shared read-only by every call.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl TrustAnchor {
    /// Build from a PEM bundle holding one or more CA certificates.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut reader = BufReader::new(pem);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse CA bundle PEM")?;
        Self::from_certs(certs)
    }

    pub fn from_certs(certs: impl IntoIterator<Item = CertificateDer<'static>>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots
                .add(cert)
                .context("Failed to add CA certificate to trust anchor")?;
        }
        if roots.is_empty() {
            bail!("no certificates found in CA bundle");
        }
        Ok(Self {
            roots: Arc::new(roots),
            provider: crypto_provider(),
        })
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }
}

/// Verify `chain` (leaf first, then intermediates) against `anchor` at the current time.
#[allow(dead_code)]
pub fn verify_chain(
    chain: &[CertificateDer<'_>],
    anchor: &TrustAnchor,
) -> Result<(), VerificationError> {
    verify_chain_at(chain, anchor, UnixTime::now())
}

/// Verify `chain` against `anchor` as of `now`. No server name is checked.
pub fn verify_chain_at(
    chain: &[CertificateDer<'_>],
    anchor: &TrustAnchor,
    now: UnixTime,
) -> Result<(), VerificationError> {
    let (leaf, pool) = chain
        .split_first()
        .ok_or(VerificationError::NoCertificatePresented)?;

    for (index, cert) in chain.iter().enumerate() {
        X509Certificate::from_der(cert.as_ref()).map_err(|e| {
            VerificationError::MalformedCertificate {
                index,
                reason: e.to_string(),
            }
        })?;
    }

    let leaf = ParsedCertificate::try_from(leaf).map_err(|e| {
        VerificationError::MalformedCertificate {
            index: 0,
            reason: e.to_string(),
        }
    })?;

    rustls::client::verify_server_cert_signed_by_trust_anchor(
        &leaf,
        &anchor.roots,
        pool,
        now,
        anchor.provider.signature_verification_algorithms.all,
    )
    .map_err(VerificationError::ChainVerificationFailed)
}

/// rustls adapter that hands the whole trust decision to [`verify_chain_at`].
///
/// One instance backs one connection; the last failure is kept so the caller
/// can report it instead of the bare TLS alert.
#[derive(Debug)]
pub struct PinnedCaVerifier {
    anchor: TrustAnchor,
    failure: Mutex<Option<VerificationError>>,
}

impl PinnedCaVerifier {
    pub fn new(anchor: TrustAnchor) -> Self {
        Self {
            anchor,
            failure: Mutex::new(None),
        }
    }

    pub fn take_failure(&self) -> Option<VerificationError> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl ServerCertVerifier for PinnedCaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        match verify_chain_at(&chain, &self.anchor, now) {
            Ok(()) => {
                debug!("Successfully verified SHC server cert");
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => {
                warn!("Rejecting SHC server cert: {}", e);
                let tls_error = rustls::Error::from(&e);
                *self
                    .failure
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(e);
                Err(tls_error)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.anchor.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.anchor.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.anchor
            .provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
