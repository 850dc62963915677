//! Signing credential loading from a PKCS#12 container.
//!
//! Real-world containers issued by Ecuadorian CAs carry the titular
//! certificate together with the CA chain, so selection matters: the
//! titular is the certificate whose key usage asserts both
//! `digitalSignature` and `nonRepudiation` and whose RSA modulus matches
//! the shipped private key. Only when no key-usage match exists does the
//! loader fall back to the first certificate bag.

use crate::config::CertificateSource;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use const_oid::{AssociatedOid, ObjectIdentifier};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;
use x509_cert::der::asn1::{Ia5StringRef, PrintableStringRef, Utf8StringRef};
use x509_cert::der::referenced::OwnedToRef;
use x509_cert::der::{Any, Decode};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{KeyUsage, SubjectAltName};
use x509_cert::Certificate;
use zeroize::Zeroizing;

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");
const OID_UID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("0.9.2342.19200300.100.1.1");
const OID_UNIQUE_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.45");
/// Private extension some Ecuadorian CAs use for the taxpayer id.
const OID_CA_TAXPAYER_ID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.37746.3.11");

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read PKCS#12 file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid base64 PKCS#12 blob: {0}")]
    InvalidBase64(String),

    #[error("failed to parse PKCS#12 container: {0}")]
    Pkcs12(String),

    #[error("PKCS#12 MAC verification failed (wrong passphrase?)")]
    WrongPassphrase,

    #[error("PKCS#12 container has no private key bag")]
    MissingKeyBag,

    #[error("PKCS#12 container has no certificate bags")]
    MissingCertificates,

    #[error("failed to parse private key: {0}")]
    InvalidKey(String),

    #[error("failed to parse certificate: {0}")]
    InvalidCertificate(String),

    #[error("private key does not match the selected certificate")]
    KeyMismatch,

    #[error("certificate not valid now (valid {not_before} through {not_after})")]
    OutsideValidity {
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    },
}

/// A loaded signing credential: RSA private key plus the titular
/// certificate and the subject attributes extracted from it.
pub struct Credential {
    private_key: RsaPrivateKey,
    private_key_pem: Zeroizing<String>,
    certificate: Certificate,
    certificate_der: Vec<u8>,
    certificate_base64: String,
    subject_common_name: Option<String>,
    taxpayer_ruc: Option<String>,
    digital_signature_cert: bool,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl Credential {
    /// Load the credential from a PKCS#12 source with the given
    /// passphrase.
    pub fn load(source: &CertificateSource, passphrase: &str) -> Result<Credential, CredentialError> {
        let der = source_bytes(source)?;
        let pfx = p12::PFX::parse(&der).map_err(|e| CredentialError::Pkcs12(format!("{e:?}")))?;
        if !pfx.verify_mac(passphrase) {
            return Err(CredentialError::WrongPassphrase);
        }

        let key_bags = pfx
            .key_bags(passphrase)
            .map_err(|e| CredentialError::Pkcs12(format!("{e:?}")))?;
        let key_der = key_bags.first().ok_or(CredentialError::MissingKeyBag)?;
        let private_key = RsaPrivateKey::from_pkcs8_der(key_der)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

        let cert_ders = pfx
            .cert_x509_bags(passphrase)
            .map_err(|e| CredentialError::Pkcs12(format!("{e:?}")))?;
        if cert_ders.is_empty() {
            return Err(CredentialError::MissingCertificates);
        }

        let mut certificates = Vec::with_capacity(cert_ders.len());
        for der in &cert_ders {
            let certificate = Certificate::from_der(der)
                .map_err(|e| CredentialError::InvalidCertificate(e.to_string()))?;
            certificates.push((certificate, der.clone()));
        }

        let expected_modulus = private_key.to_public_key().n().clone();
        let (certificate, certificate_der) = select_titular(certificates, &expected_modulus);
        Credential::from_parts(private_key, certificate, certificate_der)
    }

    /// Build a credential from already-extracted DER material. Used by
    /// callers that keep the key and certificate outside a PKCS#12.
    pub fn from_der(cert_der: &[u8], key_der: &[u8]) -> Result<Credential, CredentialError> {
        let private_key = RsaPrivateKey::from_pkcs8_der(key_der)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        let certificate = Certificate::from_der(cert_der)
            .map_err(|e| CredentialError::InvalidCertificate(e.to_string()))?;
        Credential::from_parts(private_key, certificate, cert_der.to_vec())
    }

    fn from_parts(
        private_key: RsaPrivateKey,
        certificate: Certificate,
        certificate_der: Vec<u8>,
    ) -> Result<Credential, CredentialError> {
        let cert_modulus = certificate_modulus(&certificate);
        match cert_modulus {
            Some(modulus) if modulus == *private_key.to_public_key().n() => {}
            _ => return Err(CredentialError::KeyMismatch),
        }

        let validity = &certificate.tbs_certificate.validity;
        let not_before: DateTime<Utc> = validity.not_before.to_system_time().into();
        let not_after: DateTime<Utc> = validity.not_after.to_system_time().into();
        let now = Utc::now();
        if now < not_before || now > not_after {
            return Err(CredentialError::OutsideValidity {
                not_before,
                not_after,
            });
        }

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

        let subject_common_name = subject_attribute(&certificate, OID_COMMON_NAME);
        let taxpayer_ruc = extract_taxpayer_ruc(&certificate);
        let digital_signature_cert = match certificate_key_usage(&certificate) {
            Some(usage) => usage.digital_signature() && usage.non_repudiation(),
            None => taxpayer_ruc.is_some() && subject_common_name.is_some(),
        };

        let certificate_base64 = Base64::encode_string(&certificate_der);
        Ok(Credential {
            private_key,
            private_key_pem,
            certificate,
            certificate_der,
            certificate_base64,
            subject_common_name,
            taxpayer_ruc,
            digital_signature_cert,
            not_before,
            not_after,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// PKCS#8 PEM of the private key, zeroized on drop.
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// Whitespace-free base64 of the certificate DER, ready for
    /// `ds:X509Certificate`.
    pub fn certificate_base64(&self) -> &str {
        &self.certificate_base64
    }

    pub fn subject_common_name(&self) -> Option<&str> {
        self.subject_common_name.as_deref()
    }

    /// Taxpayer RUC extracted from the certificate, already padded to
    /// 13 digits when the subject carried a 10-digit cédula.
    pub fn taxpayer_ruc(&self) -> Option<&str> {
        self.taxpayer_ruc.as_deref()
    }

    /// Whether key usage marks this as a personal signature certificate.
    pub fn is_digital_signature(&self) -> bool {
        self.digital_signature_cert
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Re-check the validity window against the current clock.
    pub fn check_validity(&self) -> Result<(), CredentialError> {
        let now = Utc::now();
        if now < self.not_before || now > self.not_after {
            return Err(CredentialError::OutsideValidity {
                not_before: self.not_before,
                not_after: self.not_after,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("subject_common_name", &self.subject_common_name)
            .field("taxpayer_ruc", &self.taxpayer_ruc)
            .field("digital_signature_cert", &self.digital_signature_cert)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn source_bytes(source: &CertificateSource) -> Result<Vec<u8>, CredentialError> {
    match source {
        CertificateSource::File(path) => std::fs::read(path).map_err(|e| CredentialError::Io {
            path: path.clone(),
            source: e,
        }),
        CertificateSource::Base64(blob) => {
            let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
            Base64::decode_vec(&compact).map_err(|e| CredentialError::InvalidBase64(e.to_string()))
        }
    }
}

fn select_titular(
    certificates: Vec<(Certificate, Vec<u8>)>,
    expected_modulus: &BigUint,
) -> (Certificate, Vec<u8>) {
    let mut fallback: Option<(Certificate, Vec<u8>)> = None;
    let mut by_modulus: Option<(Certificate, Vec<u8>)> = None;

    for (certificate, der) in certificates {
        let usage_matches = certificate_key_usage(&certificate)
            .map(|u| u.digital_signature() && u.non_repudiation())
            .unwrap_or(false);
        let modulus_matches = certificate_modulus(&certificate)
            .map(|n| n == *expected_modulus)
            .unwrap_or(false);

        if usage_matches && modulus_matches {
            return (certificate, der);
        }
        if modulus_matches && by_modulus.is_none() {
            by_modulus = Some((certificate.clone(), der.clone()));
        }
        if fallback.is_none() {
            fallback = Some((certificate, der));
        }
    }

    if let Some(selected) = by_modulus {
        warn!("no certificate asserts digitalSignature+nonRepudiation; selecting by key match");
        return selected;
    }
    warn!("no certificate matches the private key by key usage; falling back to the first bag");
    fallback.expect("caller guarantees at least one certificate")
}

fn certificate_modulus(certificate: &Certificate) -> Option<BigUint> {
    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .owned_to_ref();
    RsaPublicKey::try_from(spki).ok().map(|key| key.n().clone())
}

fn certificate_key_usage(certificate: &Certificate) -> Option<KeyUsage> {
    let extensions = certificate.tbs_certificate.extensions.as_ref()?;
    let extension = extensions.iter().find(|e| e.extn_id == KeyUsage::OID)?;
    KeyUsage::from_der(extension.extn_value.as_bytes()).ok()
}

fn subject_attribute(certificate: &Certificate, oid: ObjectIdentifier) -> Option<String> {
    for rdn in certificate.tbs_certificate.subject.0.iter() {
        for attribute in rdn.0.iter() {
            if attribute.oid == oid {
                if let Some(text) = attribute_string(&attribute.value) {
                    return Some(text);
                }
            }
        }
    }
    None
}

/// Scan order for the taxpayer id: subject serialNumber, subject UID,
/// X.500 unique identifier, subjectAltName, the CA private extension,
/// and finally the certificate serial rendered in decimal.
fn extract_taxpayer_ruc(certificate: &Certificate) -> Option<String> {
    for oid in [OID_SERIAL_NUMBER, OID_UID, OID_UNIQUE_IDENTIFIER] {
        if let Some(text) = subject_attribute(certificate, oid) {
            if let Some(ruc) = first_taxpayer_id(&text) {
                return Some(ruc);
            }
        }
    }

    if let Some(extensions) = certificate.tbs_certificate.extensions.as_ref() {
        if let Some(san) = extensions.iter().find(|e| e.extn_id == SubjectAltName::OID) {
            if let Ok(names) = SubjectAltName::from_der(san.extn_value.as_bytes()) {
                for name in names.0.iter() {
                    if let Some(ruc) = general_name_taxpayer_id(name) {
                        return Some(ruc);
                    }
                }
            }
        }
        if let Some(private) = extensions.iter().find(|e| e.extn_id == OID_CA_TAXPAYER_ID) {
            let text = String::from_utf8_lossy(private.extn_value.as_bytes());
            if let Some(ruc) = first_taxpayer_id(&text) {
                return Some(ruc);
            }
        }
    }

    let serial = BigUint::from_bytes_be(certificate.tbs_certificate.serial_number.as_bytes());
    first_taxpayer_id(&serial.to_string())
}

fn general_name_taxpayer_id(name: &GeneralName) -> Option<String> {
    match name {
        GeneralName::Rfc822Name(value) => first_taxpayer_id(value.as_str()),
        GeneralName::DnsName(value) => first_taxpayer_id(value.as_str()),
        GeneralName::DirectoryName(directory) => {
            for rdn in directory.0.iter() {
                for attribute in rdn.0.iter() {
                    if let Some(text) = attribute_string(&attribute.value) {
                        if let Some(ruc) = first_taxpayer_id(&text) {
                            return Some(ruc);
                        }
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn attribute_string(value: &Any) -> Option<String> {
    if let Ok(text) = value.decode_as::<PrintableStringRef<'_>>() {
        return Some(text.to_string());
    }
    if let Ok(text) = value.decode_as::<Utf8StringRef<'_>>() {
        return Some(text.to_string());
    }
    if let Ok(text) = value.decode_as::<Ia5StringRef<'_>>() {
        return Some(text.to_string());
    }
    None
}

/// First run of 10 to 13 digits in `text`. A 10-digit cédula is padded
/// with the `001` establishment suffix to form a RUC.
fn first_taxpayer_id(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut start = None;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            if let Some(id) = taxpayer_id_from_run(&text[s..i]) {
                return Some(id);
            }
        }
    }
    if let Some(s) = start {
        return taxpayer_id_from_run(&text[s..]);
    }
    None
}

fn taxpayer_id_from_run(run: &str) -> Option<String> {
    match run.len() {
        10 => Some(format!("{run}001")),
        11 | 12 => Some(run.to_string()),
        n if n >= 13 => Some(run[..13].to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxpayer_id_pads_cedula() {
        assert_eq!(first_taxpayer_id("0912345678"), Some("0912345678001".into()));
    }

    #[test]
    fn taxpayer_id_takes_full_ruc() {
        assert_eq!(
            first_taxpayer_id("RUC 0918097783001 - titular"),
            Some("0918097783001".into())
        );
    }

    #[test]
    fn taxpayer_id_truncates_longer_runs() {
        assert_eq!(
            first_taxpayer_id("09180977830019999"),
            Some("0918097783001".into())
        );
    }

    #[test]
    fn short_runs_are_skipped() {
        assert_eq!(first_taxpayer_id("serie 123456 lote 99"), None);
    }
}
