use std::sync::{Arc, Mutex};

use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, SignatureScheme};
use tracing::warn;

use crate::identity::ClientIdentity;
use crate::trust::{PinnedCaVerifier, TrustAnchor, VerificationError};

/// Which certificate-selection policy a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    /// Unauthenticated information endpoint. Never sends a client certificate.
    PublicNoAuth,
    /// Client registration endpoint. Never sends a client certificate; a
    /// request for one means the controller is not waiting for pairing.
    RegistrationNoAuth,
    /// Regular API. Always sends the configured client identity.
    OperationalMutualAuth,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientCertPolicyError {
    #[error("unexpected client certificate request for public endpoint")]
    UnexpectedClientCertRequest,
    #[error("SHC asked for a client certificate - have you pressed the button on SHC?")]
    DeviceNotInPairingMode,
    #[error("this client seems to be unknown to SHC - have you registered? Detail: {0}")]
    ClientCertificateRejected(String),
    #[error("no client certificate configured")]
    NoClientIdentity,
}

/// Answers the server's CertificateRequest according to an [`EndpointMode`].
///
/// Violations are recorded rather than surfaced through rustls, which would
/// only report a generic handshake failure.
#[derive(Debug)]
pub struct ClientCertPolicy {
    mode: EndpointMode,
    identity: Option<ClientIdentity>,
    violation: Mutex<Option<ClientCertPolicyError>>,
}

impl ClientCertPolicy {
    pub fn new(mode: EndpointMode, identity: Option<ClientIdentity>) -> Self {
        Self {
            mode,
            identity,
            violation: Mutex::new(None),
        }
    }

    pub fn take_violation(&self) -> Option<ClientCertPolicyError> {
        self.violation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn refuse(&self, err: ClientCertPolicyError) -> Option<Arc<CertifiedKey>> {
        warn!("Refusing client certificate request ({:?}): {}", self.mode, err);
        *self
            .violation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err);
        None
    }
}

impl ResolvesClientCert for ClientCertPolicy {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        match self.mode {
            EndpointMode::PublicNoAuth => {
                self.refuse(ClientCertPolicyError::UnexpectedClientCertRequest)
            }
            EndpointMode::RegistrationNoAuth => {
                self.refuse(ClientCertPolicyError::DeviceNotInPairingMode)
            }
            EndpointMode::OperationalMutualAuth => match &self.identity {
                None => self.refuse(ClientCertPolicyError::NoClientIdentity),
                Some(identity) => match identity.satisfies(root_hint_subjects, sigschemes) {
                    Ok(()) => Some(identity.certified_key()),
                    Err(detail) => {
                        self.refuse(ClientCertPolicyError::ClientCertificateRejected(detail))
                    }
                },
            },
        }
    }

    // Always true so that every CertificateRequest reaches `resolve`.
    fn has_certs(&self) -> bool {
        true
    }
}

/// What went wrong inside the handshake callbacks, if anything.
#[derive(Debug)]
pub enum HandshakeFailure {
    Verification(VerificationError),
    Policy(ClientCertPolicyError),
}

/// Handles onto the callbacks of one connection's TLS configuration.
#[derive(Debug)]
pub struct HandshakeProbe {
    verifier: Arc<PinnedCaVerifier>,
    policy: Arc<ClientCertPolicy>,
}

impl HandshakeProbe {
    /// An untrusted server takes precedence over anything it asked of us.
    pub fn take_failure(&self) -> Option<HandshakeFailure> {
        if let Some(err) = self.verifier.take_failure() {
            return Some(HandshakeFailure::Verification(err));
        }
        self.policy.take_violation().map(HandshakeFailure::Policy)
    }
}

/// Build a single-use client configuration for `mode`.
///
/// Built-in verification is replaced entirely by [`PinnedCaVerifier`].
pub fn client_config(
    mode: EndpointMode,
    anchor: &TrustAnchor,
    identity: Option<&ClientIdentity>,
) -> Result<(ClientConfig, HandshakeProbe), rustls::Error> {
    let verifier = Arc::new(PinnedCaVerifier::new(anchor.clone()));
    let identity = match mode {
        EndpointMode::OperationalMutualAuth => identity.cloned(),
        EndpointMode::PublicNoAuth | EndpointMode::RegistrationNoAuth => None,
    };
    let policy = Arc::new(ClientCertPolicy::new(mode, identity));

    let config = ClientConfig::builder_with_provider(Arc::clone(anchor.provider()))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone())
        .with_client_cert_resolver(policy.clone());

    Ok((config, HandshakeProbe { verifier, policy }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestCa;

    const SCHEMES: &[SignatureScheme] = &[
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::RSA_PSS_SHA256,
    ];

    #[test]
    fn public_mode_refuses_and_records() {
        let identity = TestCa::root("CA").leaf(&[]).identity();
        let policy = ClientCertPolicy::new(EndpointMode::PublicNoAuth, Some(identity));
        assert!(policy.resolve(&[], SCHEMES).is_none());
        assert_eq!(
            policy.take_violation(),
            Some(ClientCertPolicyError::UnexpectedClientCertRequest)
        );
    }

    #[test]
    fn registration_mode_signals_missing_pairing_mode() {
        let identity = TestCa::root("CA").leaf(&[]).identity();
        let policy = ClientCertPolicy::new(EndpointMode::RegistrationNoAuth, Some(identity));
        assert!(policy.resolve(&[], SCHEMES).is_none());
        assert_eq!(
            policy.take_violation(),
            Some(ClientCertPolicyError::DeviceNotInPairingMode)
        );
    }

    #[test]
    fn operational_mode_presents_the_identity() {
        let ca = TestCa::root("CA");
        let identity = ca.leaf(&[]).identity();
        let policy =
            ClientCertPolicy::new(EndpointMode::OperationalMutualAuth, Some(identity.clone()));
        let subject = ca.subject_der();
        let key = policy.resolve(&[&subject], SCHEMES).unwrap();
        assert_eq!(key.cert[0], *identity.leaf());
        assert!(policy.take_violation().is_none());
    }

    #[test]
    fn operational_mode_rejects_unacceptable_identity() {
        let identity = TestCa::root("CA").leaf(&[]).identity();
        let policy = ClientCertPolicy::new(EndpointMode::OperationalMutualAuth, Some(identity));
        let foreign = TestCa::root("Other CA").subject_der();
        assert!(policy.resolve(&[&foreign], SCHEMES).is_none());
        assert!(matches!(
            policy.take_violation(),
            Some(ClientCertPolicyError::ClientCertificateRejected(_))
        ));
    }

    #[test]
    fn operational_mode_without_identity() {
        let policy = ClientCertPolicy::new(EndpointMode::OperationalMutualAuth, None);
        assert!(policy.resolve(&[], SCHEMES).is_none());
        assert_eq!(
            policy.take_violation(),
            Some(ClientCertPolicyError::NoClientIdentity)
        );
    }

    #[test]
    fn no_auth_configs_drop_the_identity() {
        let ca = TestCa::root("CA");
        let identity = ca.leaf(&[]).identity();
        let (_, probe) =
            client_config(EndpointMode::PublicNoAuth, &ca.anchor(), Some(&identity)).unwrap();
        assert!(probe.policy.identity.is_none());
        assert!(probe.take_failure().is_none());
    }
}
