// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Certificate validation. The channel layer calls a [`CertificateValidator`] on the remote
//! certificate during the open secure channel handshake; hosts plug in their own trust
//! decisions.

use uasc_types::{Error, StatusCode};

use crate::x509::{Thumbprint, X509};

/// Decides whether a peer certificate is trusted.
pub trait CertificateValidator: Send + Sync {
    /// Verify the certificate, returning an error with a `BadCertificate*` or
    /// `BadSecurityChecksFailed` status if it is not trusted.
    fn verify(&self, certificate: &X509) -> Result<(), Error>;
}

/// Accepts every syntactically valid certificate. The default, suitable for tests and for
/// deployments that pin trust at a different layer.
#[derive(Debug, Default)]
pub struct AcceptAllValidator;

impl CertificateValidator for AcceptAllValidator {
    fn verify(&self, _certificate: &X509) -> Result<(), Error> {
        Ok(())
    }
}

/// Accepts only certificates whose thumbprint is in a fixed trust list.
#[derive(Debug, Default)]
pub struct ThumbprintValidator {
    trusted: Vec<Thumbprint>,
}

impl ThumbprintValidator {
    /// Create a validator trusting exactly the given certificates.
    pub fn new(trusted: impl IntoIterator<Item = Thumbprint>) -> Self {
        Self {
            trusted: trusted.into_iter().collect(),
        }
    }

    /// Add a certificate to the trust list.
    pub fn trust(&mut self, certificate: &X509) {
        self.trusted.push(certificate.thumbprint());
    }
}

impl CertificateValidator for ThumbprintValidator {
    fn verify(&self, certificate: &X509) -> Result<(), Error> {
        let thumbprint = certificate.thumbprint();
        if self.trusted.contains(&thumbprint) {
            Ok(())
        } else {
            Err(Error::new(
                StatusCode::BadCertificateUntrusted,
                "Certificate thumbprint is not in the trust list",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkey::PrivateKey;

    #[test]
    fn thumbprint_validator() {
        let key = PrivateKey::new(2048).unwrap();
        let trusted_cert = X509::self_signed(&key, "trusted", 1).unwrap();
        let other_cert = X509::self_signed(&key, "untrusted", 1).unwrap();

        let mut validator = ThumbprintValidator::default();
        validator.trust(&trusted_cert);

        assert!(validator.verify(&trusted_cert).is_ok());
        assert!(validator.verify(&other_cert).is_err());
        assert!(AcceptAllValidator.verify(&other_cert).is_ok());
    }
}
