// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! X509 certificate wrapper. Certificates travel on the wire in DER form inside byte
//! strings; this type keeps the raw DER next to the parsed certificate.

use std::str::FromStr;

use sha1::{Digest, Sha1};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::{Decode, Encode},
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
    Certificate,
};

use rsa::pkcs8::DecodePublicKey;

use uasc_types::{ByteString, Error, StatusCode};

use crate::pkey::{PrivateKey, PublicKey};

/// The SHA-1 digest of a certificate's DER encoding, sent as the receiver certificate
/// thumbprint in asymmetric security headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbprint {
    value: [u8; Thumbprint::THUMBPRINT_SIZE],
}

impl Thumbprint {
    /// Length of a thumbprint in bytes.
    pub const THUMBPRINT_SIZE: usize = 20;

    /// Compute the thumbprint of DER data.
    pub fn new(der: &[u8]) -> Thumbprint {
        let digest = Sha1::digest(der);
        let mut value = [0u8; Self::THUMBPRINT_SIZE];
        value.copy_from_slice(&digest);
        Thumbprint { value }
    }

    /// The thumbprint bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The thumbprint as a byte string for the wire.
    pub fn as_byte_string(&self) -> ByteString {
        ByteString::from(&self.value[..])
    }
}

/// An X509 certificate.
#[derive(Debug, Clone)]
pub struct X509 {
    der: Vec<u8>,
    certificate: Certificate,
}

impl X509 {
    /// Parse a certificate from its DER encoding.
    pub fn from_der(der: &[u8]) -> Result<X509, Error> {
        let certificate = Certificate::from_der(der).map_err(|e| {
            Error::new(
                StatusCode::BadCertificateInvalid,
                format!("Certificate cannot be parsed: {e}"),
            )
        })?;
        Ok(X509 {
            der: der.to_vec(),
            certificate,
        })
    }

    /// Parse a certificate from a byte string received off the wire.
    pub fn from_byte_string(value: &ByteString) -> Result<X509, Error> {
        if value.is_null() {
            Err(Error::new(
                StatusCode::BadCertificateInvalid,
                "Certificate byte string is null",
            ))
        } else {
            X509::from_der(value.as_ref())
        }
    }

    /// Create a self-signed certificate for `common_name` over the supplied key. Hosts with
    /// real PKI load their certificate from disk instead; this is primarily for tests and
    /// first-run convenience.
    pub fn self_signed(
        key: &PrivateKey,
        common_name: &str,
        validity_days: u64,
    ) -> Result<X509, Error> {
        let bad = |e: String| Error::new(StatusCode::BadCertificateInvalid, e);

        let subject =
            Name::from_str(&format!("CN={common_name}")).map_err(|e| bad(e.to_string()))?;
        let validity = Validity::from_now(std::time::Duration::from_secs(validity_days * 86400))
            .map_err(|e| bad(e.to_string()))?;
        let spki_der = key.public_key().public_key_der()?;
        let spki =
            SubjectPublicKeyInfoOwned::from_der(&spki_der).map_err(|e| bad(e.to_string()))?;

        let signer = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key.inner().clone());
        let builder = CertificateBuilder::new(
            Profile::Root,
            SerialNumber::from(1u32),
            validity,
            subject,
            spki,
            &signer,
        )
        .map_err(|e| bad(e.to_string()))?;
        let certificate = builder
            .build::<rsa::pkcs1v15::Signature>()
            .map_err(|e| bad(e.to_string()))?;
        let der = certificate.to_der().map_err(|e| bad(e.to_string()))?;
        Ok(X509 { der, certificate })
    }

    /// The certificate's DER encoding as a byte string for the wire.
    pub fn as_byte_string(&self) -> ByteString {
        ByteString::from(&self.der[..])
    }

    /// The certificate's DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The public key held by the certificate. Fails if it is not an RSA key.
    pub fn public_key(&self) -> Result<PublicKey, Error> {
        let spki = self
            .certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| Error::new(StatusCode::BadCertificateInvalid, e.to_string()))?;
        let key = rsa::RsaPublicKey::from_public_key_der(&spki).map_err(|e| {
            Error::new(
                StatusCode::BadCertificateInvalid,
                format!("Certificate does not hold an RSA key: {e}"),
            )
        })?;
        Ok(PublicKey(key))
    }

    /// The SHA-1 thumbprint of the certificate.
    pub fn thumbprint(&self) -> Thumbprint {
        Thumbprint::new(&self.der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_round_trip() {
        let key = PrivateKey::new(2048).unwrap();
        let cert = X509::self_signed(&key, "uasc test", 365).unwrap();

        let byte_string = cert.as_byte_string();
        let restored = X509::from_byte_string(&byte_string).unwrap();
        assert_eq!(restored.thumbprint(), cert.thumbprint());

        // The certificate's public key must verify what the private key signs.
        let public = restored.public_key().unwrap();
        let mut signature = vec![0u8; crate::pkey::KeySize::size(&key)];
        key.sign_sha256(b"payload", &mut signature).unwrap();
        public.verify_sha256(b"payload", &signature).unwrap();
    }

    #[test]
    fn null_byte_string_rejected() {
        assert!(X509::from_byte_string(&ByteString::null()).is_err());
    }

    #[test]
    fn thumbprint_size() {
        assert_eq!(Thumbprint::new(b"anything").value().len(), 20);
    }
}
