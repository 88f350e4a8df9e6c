// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Holds the application instance certificate and private key, plus the validator used to
//! judge peer certificates.

use std::sync::Arc;

use uasc_types::{Error, StatusCode};

use crate::{
    pkey::PrivateKey,
    validator::{AcceptAllValidator, CertificateValidator},
    x509::X509,
};

/// The application's own certificate and key, and its trust decisions. File-system PKI is a
/// host concern; hosts load or generate material and hand it over here.
pub struct CertificateStore {
    own_certificate: Option<X509>,
    own_private_key: Option<PrivateKey>,
    validator: Arc<dyn CertificateValidator>,
}

impl Default for CertificateStore {
    fn default() -> Self {
        CertificateStore {
            own_certificate: None,
            own_private_key: None,
            validator: Arc::new(AcceptAllValidator),
        }
    }
}

impl CertificateStore {
    /// A store with the given certificate and key.
    pub fn new(certificate: X509, private_key: PrivateKey) -> CertificateStore {
        CertificateStore {
            own_certificate: Some(certificate),
            own_private_key: Some(private_key),
            validator: Arc::new(AcceptAllValidator),
        }
    }

    /// A store with a freshly generated self-signed certificate, for hosts without
    /// provisioned PKI.
    pub fn new_self_signed(common_name: &str) -> Result<CertificateStore, Error> {
        let key = PrivateKey::new(2048)?;
        let certificate = X509::self_signed(&key, common_name, 365)?;
        Ok(CertificateStore::new(certificate, key))
    }

    /// Replace the peer certificate validator.
    pub fn set_validator(&mut self, validator: Arc<dyn CertificateValidator>) {
        self.validator = validator;
    }

    /// The validator used to judge peer certificates.
    pub fn validator(&self) -> Arc<dyn CertificateValidator> {
        self.validator.clone()
    }

    /// Our own certificate, if the store holds one.
    pub fn read_own_cert(&self) -> Result<X509, Error> {
        self.own_certificate.clone().ok_or_else(|| {
            Error::new(
                StatusCode::BadCertificateInvalid,
                "No application instance certificate configured",
            )
        })
    }

    /// Our own private key, if the store holds one. The key is re-parsed from PEM because
    /// private keys are deliberately not `Clone`.
    pub fn read_own_pkey(&self) -> Result<PrivateKey, Error> {
        let key = self.own_private_key.as_ref().ok_or_else(|| {
            Error::new(
                StatusCode::BadCertificateInvalid,
                "No application instance private key configured",
            )
        })?;
        PrivateKey::from_pem(&key.to_pem()?)
    }
}
