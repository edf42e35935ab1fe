use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use serde::{Deserialize, Serialize};
use x509_parser::prelude::*;

const BEGIN_MARKER: &str = "-----BEGIN CERTIFICATE-----";
const END_MARKER: &str = "-----END CERTIFICATE-----";
const PEM_LINE_WIDTH: usize = 64;

/// Client certificate chain plus signing key, used for mutual TLS.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    certified_key: Arc<CertifiedKey>,
    // Raw DER issuer name of every certificate in the chain.
    issuers: Vec<Vec<u8>>,
}

impl ClientIdentity {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        if chain.is_empty() {
            bail!("client certificate chain is empty");
        }

        let issuers = chain
            .iter()
            .map(|cert| {
                X509Certificate::from_der(cert.as_ref())
                    .map(|(_, parsed)| parsed.issuer().as_raw().to_vec())
                    .map_err(|e| anyhow!("Failed to parse client certificate: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let signing_key = crate::trust::crypto_provider()
            .key_provider
            .load_private_key(key)
            .context("Unsupported client private key")?;

        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            issuers,
        })
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let mut cert_reader = BufReader::new(cert_pem);
        let chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse client certificate PEM")?;

        let mut key_reader = BufReader::new(key_pem);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .context("Failed to parse client key PEM")?
            .ok_or_else(|| anyhow!("No private key found"))?;

        Self::new(chain, key)
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read client cert: {}", cert_path.display()))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("Failed to read client key: {}", key_path.display()))?;
        Self::from_pem(&cert_pem, &key_pem).with_context(|| {
            format!(
                "can't parse client key / cert '{}'/'{}'",
                key_path.display(),
                cert_path.display()
            )
        })
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.certified_key.cert[0]
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// Check the identity against a server's CertificateRequest.
    ///
    /// The key must sign with one of the offered schemes, and when the server
    /// names acceptable CAs one of our certificates must be issued by one.
    pub(crate) fn satisfies(
        &self,
        acceptable_cas: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> std::result::Result<(), String> {
        let key = &self.certified_key.key;
        if key.choose_scheme(sigschemes).is_none() {
            return Err(format!(
                "{:?} key can't sign with any scheme the server offers",
                key.algorithm()
            ));
        }

        if !acceptable_cas.is_empty()
            && !self
                .issuers
                .iter()
                .any(|issuer| acceptable_cas.iter().any(|ca| name_matches(ca, issuer)))
        {
            return Err("certificate is not issued by any CA the server accepts".to_string());
        }

        Ok(())
    }
}

// CA hints may or may not carry the outer SEQUENCE header of the Name.
fn name_matches(hint: &[u8], issuer: &[u8]) -> bool {
    hint == issuer || der_contents(issuer) == Some(hint)
}

fn der_contents(tlv: &[u8]) -> Option<&[u8]> {
    let len_byte = *tlv.get(1)?;
    let header = if len_byte < 0x80 {
        2
    } else {
        2 + usize::from(len_byte & 0x7f)
    };
    tlv.get(header..)
}

/// How the client certificate is rendered into the registration payload.
///
/// Controller firmware has accepted two shapes over time. Plain PEM is what
/// current controllers register successfully; the single-line form follows the
/// vendor's published API collection, which replaces every line break with a
/// lone `\r`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateEncoding {
    #[default]
    Pem,
    SingleLine,
}

impl CertificateEncoding {
    pub fn encode(self, der: &[u8]) -> String {
        let body = STANDARD.encode(der);
        match self {
            CertificateEncoding::Pem => {
                let mut out = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 64);
                out.push_str(BEGIN_MARKER);
                out.push('\n');
                let mut start = 0;
                while start < body.len() {
                    let end = (start + PEM_LINE_WIDTH).min(body.len());
                    out.push_str(&body[start..end]);
                    out.push('\n');
                    start = end;
                }
                out.push_str(END_MARKER);
                out.push('\n');
                out
            }
            CertificateEncoding::SingleLine => {
                format!("{}\r{}\r{}", BEGIN_MARKER, body, END_MARKER)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum CertificateTextError {
    #[error("certificate text has no BEGIN/END CERTIFICATE markers")]
    MissingMarkers,
    #[error("certificate body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decode certificate text produced by either [`CertificateEncoding`] back to DER.
#[allow(dead_code)]
pub fn decode_certificate_text(text: &str) -> Result<CertificateDer<'static>, CertificateTextError> {
    let start = text
        .find(BEGIN_MARKER)
        .ok_or(CertificateTextError::MissingMarkers)?
        + BEGIN_MARKER.len();
    let end = text[start..]
        .find(END_MARKER)
        .ok_or(CertificateTextError::MissingMarkers)?
        + start;

    // Tolerate the escaped two-character forms as well as real line breaks.
    let body: String = text[start..end]
        .replace("\\r", "")
        .replace("\\n", "")
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    Ok(CertificateDer::from(STANDARD.decode(body)?))
}
