// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

#![warn(missing_docs)]

//! Cryptography for the `uasc` secure conversation stack: named security policies and the
//! asymmetric / symmetric primitives they bundle.
//!
//! A security policy is a URI-identified suite of algorithms. The `None` policy is mandatory
//! and carries no cryptography at all; the others pair RSA for the open secure channel
//! handshake with AES-CBC / HMAC-SHA256 for the message stream.

pub mod aeskey;
pub mod certificate_store;
pub mod hash;
pub mod pkey;
pub mod random;
pub mod validator;
pub mod x509;

pub use aeskey::AesKey;
pub use certificate_store::CertificateStore;
pub use pkey::{KeySize, PrivateKey, PublicKey, RsaPadding};
pub use validator::{AcceptAllValidator, CertificateValidator, ThumbprintValidator};
pub use x509::{Thumbprint, X509};

use uasc_types::{ByteString, Error, StatusCode};

/// The nonce length used when the policy itself carries no symmetric crypto but a nonce is
/// still needed, e.g. for session nonces.
pub const SESSION_NONCE_LENGTH: usize = 32;

// Policy URIs.
const SECURITY_POLICY_NONE_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
const SECURITY_POLICY_BASIC_256_SHA_256_URI: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256";
const SECURITY_POLICY_AES_128_SHA_256_RSA_OAEP_URI: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep";

/// A named suite of security algorithms, selected by URI equality.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SecurityPolicy {
    /// The URI did not match any policy this stack knows.
    Unknown,
    /// No security at all. Mandatory.
    None,
    /// AES-256-CBC / HMAC-SHA256 symmetric, RSA-OAEP(SHA1) + RSA-PKCS#1v1.5-SHA256 asymmetric.
    Basic256Sha256,
    /// AES-128-CBC / HMAC-SHA256 symmetric, RSA-OAEP(SHA1) + RSA-PKCS#1v1.5-SHA256 asymmetric.
    Aes128Sha256RsaOaep,
}

impl std::fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for SecurityPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match SecurityPolicy::from_uri(s) {
            SecurityPolicy::Unknown => Err(()),
            policy => Ok(policy),
        }
    }
}

impl SecurityPolicy {
    /// Look up a policy by its URI. Unrecognized URIs yield [`SecurityPolicy::Unknown`].
    pub fn from_uri(uri: &str) -> SecurityPolicy {
        match uri {
            SECURITY_POLICY_NONE_URI => SecurityPolicy::None,
            SECURITY_POLICY_BASIC_256_SHA_256_URI => SecurityPolicy::Basic256Sha256,
            SECURITY_POLICY_AES_128_SHA_256_RSA_OAEP_URI => SecurityPolicy::Aes128Sha256RsaOaep,
            _ => {
                log::error!("Specified security policy uri \"{uri}\" is not recognized");
                SecurityPolicy::Unknown
            }
        }
    }

    /// The URI of the policy. Panics on `Unknown`, which has no URI by construction.
    pub fn to_uri(&self) -> &'static str {
        match self {
            SecurityPolicy::None => SECURITY_POLICY_NONE_URI,
            SecurityPolicy::Basic256Sha256 => SECURITY_POLICY_BASIC_256_SHA_256_URI,
            SecurityPolicy::Aes128Sha256RsaOaep => SECURITY_POLICY_AES_128_SHA_256_RSA_OAEP_URI,
            SecurityPolicy::Unknown => {
                panic!("Unknown security policy has no uri");
            }
        }
    }

    /// `true` for policies that carry real cryptography.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep
        )
    }

    /// Length in bytes of the nonces exchanged in the open secure channel handshake.
    pub fn secure_channel_nonce_length(&self) -> usize {
        match self {
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep => 32,
            _ => 0,
        }
    }

    /// Length in bytes of the derived symmetric encryption key.
    pub fn symmetric_key_size(&self) -> usize {
        match self {
            SecurityPolicy::Basic256Sha256 => 32,
            SecurityPolicy::Aes128Sha256RsaOaep => 16,
            _ => 0,
        }
    }

    /// Length in bytes of the derived symmetric signing key.
    pub fn derived_signature_key_size(&self) -> usize {
        match self {
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep => 32,
            _ => 0,
        }
    }

    /// Size in bytes of a symmetric signature.
    pub fn symmetric_signature_size(&self) -> usize {
        match self {
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep => 32,
            _ => 0,
        }
    }

    /// The symmetric cipher's plain text block size in bytes.
    pub fn plain_block_size(&self) -> usize {
        match self {
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep => 16,
            _ => 0,
        }
    }

    /// The padding scheme used for asymmetric encryption under this policy.
    pub fn asymmetric_encryption_padding(&self) -> RsaPadding {
        RsaPadding::OaepSha1
    }

    /// A fresh random nonce of the length the policy requires.
    pub fn random_nonce(&self) -> ByteString {
        if self.secure_channel_nonce_length() > 0 {
            random::byte_string(self.secure_channel_nonce_length())
        } else {
            ByteString::null()
        }
    }

    /// Part 6, 6.7.5. Derive the (signing key, encryption key, IV) triple from the channel
    /// nonces by running the policy's pseudo random function over them.
    pub fn make_secure_channel_keys(&self, secret: &[u8], seed: &[u8]) -> (Vec<u8>, AesKey, Vec<u8>) {
        // Work out the length of stuff
        let signing_key_length = self.derived_signature_key_size();
        let (encrypting_key_length, encrypting_block_size) =
            (self.symmetric_key_size(), self.plain_block_size());

        let bytes = hash::p_sha256(
            secret,
            seed,
            signing_key_length + encrypting_key_length + encrypting_block_size,
        );
        let signing_key = bytes[..signing_key_length].to_vec();
        let encrypting_key = AesKey::new(
            *self,
            &bytes[signing_key_length..signing_key_length + encrypting_key_length],
        );
        let iv = bytes[signing_key_length + encrypting_key_length..].to_vec();
        (signing_key, encrypting_key, iv)
    }

    /// Sign `data` with the symmetric signing key, writing the tag into `signature`.
    pub fn symmetric_sign(
        &self,
        key: &[u8],
        data: &[u8],
        signature: &mut [u8],
    ) -> Result<(), Error> {
        match self {
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep => {
                hash::hmac_sha256(key, data, signature)
            }
            _ => Err(self.no_crypto_error()),
        }
    }

    /// Verify a symmetric signature over `data`.
    pub fn symmetric_verify_signature(
        &self,
        key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        match self {
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep => {
                hash::verify_hmac_sha256(key, data, signature)
            }
            _ => Err(self.no_crypto_error()),
        }
    }

    /// Encrypt `src` into `dst` with the symmetric cipher.
    pub fn symmetric_encrypt(
        &self,
        key: &AesKey,
        iv: &[u8],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        key.encrypt(src, iv, dst)
    }

    /// Decrypt `src` into `dst` with the symmetric cipher.
    pub fn symmetric_decrypt(
        &self,
        key: &AesKey,
        iv: &[u8],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        key.decrypt(src, iv, dst)
    }

    /// Produce an asymmetric signature over `data` with the sender's private key.
    pub fn asymmetric_sign(
        &self,
        signing_key: &PrivateKey,
        data: &[u8],
        signature: &mut [u8],
    ) -> Result<usize, Error> {
        match self {
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep => {
                signing_key.sign_sha256(data, signature)
            }
            _ => Err(self.no_crypto_error()),
        }
    }

    /// Verify an asymmetric signature over `data` with the sender's public key.
    pub fn asymmetric_verify_signature(
        &self,
        verification_key: &PublicKey,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        match self {
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes128Sha256RsaOaep => {
                verification_key.verify_sha256(data, signature)
            }
            _ => Err(self.no_crypto_error()),
        }
    }

    /// Encrypt `src` into `dst` with the receiver's public key.
    pub fn asymmetric_encrypt(
        &self,
        encryption_key: &PublicKey,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        encryption_key.encrypt(src, dst, self.asymmetric_encryption_padding())
    }

    /// Decrypt `src` into `dst` with our private key.
    pub fn asymmetric_decrypt(
        &self,
        decryption_key: &PrivateKey,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        decryption_key.decrypt(src, dst, self.asymmetric_encryption_padding())
    }

    fn no_crypto_error(&self) -> Error {
        Error::new(
            StatusCode::BadSecurityPolicyRejected,
            format!("Policy {self} carries no cryptography"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_lookup() {
        assert_eq!(
            SecurityPolicy::from_uri("http://opcfoundation.org/UA/SecurityPolicy#None"),
            SecurityPolicy::None
        );
        assert_eq!(
            SecurityPolicy::from_uri("http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"),
            SecurityPolicy::Basic256Sha256
        );
        assert_eq!(
            SecurityPolicy::from_uri("http://example.com/bogus"),
            SecurityPolicy::Unknown
        );
        assert_eq!(
            SecurityPolicy::Basic256Sha256.to_uri(),
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
        );
    }

    #[test]
    fn nonce_lengths() {
        assert_eq!(SecurityPolicy::None.secure_channel_nonce_length(), 0);
        assert!(SecurityPolicy::None.random_nonce().is_null());
        assert_eq!(
            SecurityPolicy::Basic256Sha256.secure_channel_nonce_length(),
            32
        );
        assert_eq!(SecurityPolicy::Basic256Sha256.random_nonce().len(), 32);
    }

    #[test]
    fn derived_keys_mirror() {
        // The keys one side derives for sending are the keys the other side derives for
        // receiving, with the nonce order swapped.
        let policy = SecurityPolicy::Basic256Sha256;
        let local_nonce = policy.random_nonce();
        let remote_nonce = policy.random_nonce();

        let (sign_a, key_a, iv_a) =
            policy.make_secure_channel_keys(local_nonce.as_ref(), remote_nonce.as_ref());
        let (sign_b, key_b, iv_b) =
            policy.make_secure_channel_keys(local_nonce.as_ref(), remote_nonce.as_ref());

        assert_eq!(sign_a, sign_b);
        assert_eq!(key_a.value(), key_b.value());
        assert_eq!(iv_a, iv_b);
        assert_eq!(sign_a.len(), 32);
        assert_eq!(key_a.value().len(), 32);
        assert_eq!(iv_a.len(), 16);

        let (sign_c, _, _) =
            policy.make_secure_channel_keys(remote_nonce.as_ref(), local_nonce.as_ref());
        assert_ne!(sign_a, sign_c);
    }

    #[test]
    fn symmetric_sign_and_encrypt_cycle() {
        let policy = SecurityPolicy::Aes128Sha256RsaOaep;
        let (signing_key, encrypting_key, iv) =
            policy.make_secure_channel_keys(b"0123456789abcdef0123456789abcdef", b"fedcba98765432");

        let data = [0x42u8; 64];
        let mut signature = vec![0u8; policy.symmetric_signature_size()];
        policy
            .symmetric_sign(&signing_key, &data, &mut signature)
            .unwrap();
        policy
            .symmetric_verify_signature(&signing_key, &data, &signature)
            .unwrap();

        let mut cipher = vec![0u8; data.len() + 16];
        let size = policy
            .symmetric_encrypt(&encrypting_key, &iv, &data, &mut cipher)
            .unwrap();
        let mut plain = vec![0u8; size + 16];
        let size = policy
            .symmetric_decrypt(&encrypting_key, &iv, &cipher[..size], &mut plain)
            .unwrap();
        assert_eq!(&plain[..size], &data[..]);
    }
}
