// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Asymmetric (RSA) key wrappers: signing, verification, and block-wise encryption of
//! message chunks.

use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
    traits::PublicKeyParts,
    Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};

use uasc_types::{Error, StatusCode};

/// The padding scheme used when encrypting with an RSA key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RsaPadding {
    /// PKCS#1 v1.5 padding.
    Pkcs1,
    /// OAEP padding with a SHA-1 mask generation function.
    OaepSha1,
    /// OAEP padding with a SHA-256 mask generation function.
    OaepSha256,
}

impl RsaPadding {
    /// The number of bytes the padding scheme consumes in each ciphertext block.
    pub fn byte_count(&self) -> usize {
        match self {
            RsaPadding::Pkcs1 => 11,
            // 2 * hash length + 2
            RsaPadding::OaepSha1 => 42,
            RsaPadding::OaepSha256 => 66,
        }
    }
}

/// Implemented by keys to report their size.
pub trait KeySize {
    /// The length of the key in bits.
    fn bit_length(&self) -> usize;

    /// The length of the key in bytes, which is also the signature and cipher block size.
    fn size(&self) -> usize {
        self.bit_length() / 8
    }

    /// The number of plain text bytes that fit in one encrypted block under `padding`.
    fn plain_text_block_size(&self, padding: RsaPadding) -> usize {
        self.size() - padding.byte_count()
    }

    /// The ciphertext size produced by encrypting `plain_text_size` bytes under `padding`.
    /// Each (partial) plain text block becomes a whole cipher block.
    fn calculate_cipher_text_size(&self, plain_text_size: usize, padding: RsaPadding) -> usize {
        let block_size = self.plain_text_block_size(padding);
        let blocks = plain_text_size.div_ceil(block_size);
        blocks * self.size()
    }
}

/// An RSA private key.
pub struct PrivateKey(RsaPrivateKey);

impl KeySize for PrivateKey {
    fn bit_length(&self) -> usize {
        self.0.size() * 8
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        write!(f, "PrivateKey({} bits)", self.bit_length())
    }
}

impl PrivateKey {
    /// Generate a fresh RSA key of `bit_length` bits.
    pub fn new(bit_length: usize) -> Result<PrivateKey, Error> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bit_length)
            .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?;
        Ok(PrivateKey(key))
    }

    /// Read a key from PKCS#8 PEM.
    pub fn from_pem(pem: &str) -> Result<PrivateKey, Error> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))?;
        Ok(PrivateKey(key))
    }

    /// Serialize the key to PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<String, Error> {
        let pem = self
            .0
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?;
        Ok(pem.to_string())
    }

    /// The public half of this key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.to_public_key())
    }

    pub(crate) fn inner(&self) -> &RsaPrivateKey {
        &self.0
    }

    /// Sign `data` with RSA-PKCS#1 v1.5 over a SHA-256 digest, writing `self.size()` bytes
    /// into `signature`.
    pub fn sign_sha256(&self, data: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        let digest = Sha256::digest(data);
        let sig = self
            .0
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))?;
        if signature.len() != sig.len() {
            return Err(Error::new(
                StatusCode::BadSecurityChecksFailed,
                format!(
                    "Signature buffer size {} does not match key size {}",
                    signature.len(),
                    sig.len()
                ),
            ));
        }
        signature.copy_from_slice(&sig);
        Ok(sig.len())
    }

    /// Decrypt `src` block-wise into `dst`, returning the number of plaintext bytes.
    pub fn decrypt(&self, src: &[u8], dst: &mut [u8], padding: RsaPadding) -> Result<usize, Error> {
        let block_size = self.size();
        if src.len() % block_size != 0 {
            return Err(Error::new(
                StatusCode::BadSecurityChecksFailed,
                format!(
                    "Cipher text length {} is not a multiple of the key size {}",
                    src.len(),
                    block_size
                ),
            ));
        }
        let mut written = 0;
        for block in src.chunks(block_size) {
            let plain = match padding {
                RsaPadding::Pkcs1 => self.0.decrypt(Pkcs1v15Encrypt, block),
                RsaPadding::OaepSha1 => self.0.decrypt(Oaep::new::<sha1::Sha1>(), block),
                RsaPadding::OaepSha256 => self.0.decrypt(Oaep::new::<Sha256>(), block),
            }
            .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))?;
            dst[written..written + plain.len()].copy_from_slice(&plain);
            written += plain.len();
        }
        Ok(written)
    }
}

/// An RSA public key, usually lifted out of an X509 certificate.
#[derive(Clone)]
pub struct PublicKey(pub(crate) RsaPublicKey);

impl KeySize for PublicKey {
    fn bit_length(&self) -> usize {
        self.0.size() * 8
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({} bits)", self.bit_length())
    }
}

impl PublicKey {
    /// Verify an RSA-PKCS#1 v1.5 SHA-256 signature over `data`.
    pub fn verify_sha256(&self, data: &[u8], signature: &[u8]) -> Result<(), Error> {
        let digest = Sha256::digest(data);
        self.0
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|_| {
                Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    "RSA signature verification failed",
                )
            })
    }

    /// The DER encoding of this key as a SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Result<Vec<u8>, Error> {
        Ok(self
            .0
            .to_public_key_der()
            .map_err(|e| Error::new(StatusCode::BadUnexpectedError, e.to_string()))?
            .into_vec())
    }

    /// Encrypt `src` block-wise into `dst`, returning the number of ciphertext bytes.
    /// Every plain text block of up to [`KeySize::plain_text_block_size`] bytes becomes one
    /// cipher block of [`KeySize::size`] bytes.
    pub fn encrypt(&self, src: &[u8], dst: &mut [u8], padding: RsaPadding) -> Result<usize, Error> {
        let mut rng = rand::thread_rng();
        let plain_block_size = self.plain_text_block_size(padding);
        let cipher_block_size = self.size();
        let mut written = 0;
        for block in src.chunks(plain_block_size) {
            let cipher = match padding {
                RsaPadding::Pkcs1 => self.0.encrypt(&mut rng, Pkcs1v15Encrypt, block),
                RsaPadding::OaepSha1 => self.0.encrypt(&mut rng, Oaep::new::<sha1::Sha1>(), block),
                RsaPadding::OaepSha256 => self.0.encrypt(&mut rng, Oaep::new::<Sha256>(), block),
            }
            .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))?;
            if written + cipher.len() > dst.len() {
                return Err(Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    "Destination buffer is too small for the cipher text",
                ));
            }
            dst[written..written + cipher.len()].copy_from_slice(&cipher);
            written += cipher_block_size;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> PrivateKey {
        // 2048-bit keygen is slow in debug builds, do it once.
        use std::sync::OnceLock;
        static KEY: OnceLock<String> = OnceLock::new();
        let pem = KEY.get_or_init(|| PrivateKey::new(2048).unwrap().to_pem().unwrap());
        PrivateKey::from_pem(pem).unwrap()
    }

    #[test]
    fn sign_and_verify() {
        let key = test_key();
        let public = key.public_key();
        let mut signature = vec![0u8; key.size()];
        key.sign_sha256(b"message to sign", &mut signature).unwrap();
        public.verify_sha256(b"message to sign", &signature).unwrap();
        assert!(public.verify_sha256(b"another message", &signature).is_err());
    }

    #[test]
    fn encrypt_and_decrypt_multiple_blocks() {
        let key = test_key();
        let public = key.public_key();

        let padding = RsaPadding::OaepSha1;
        let plain = vec![0xa5u8; 600];
        let cipher_size = public.calculate_cipher_text_size(plain.len(), padding);
        let mut cipher = vec![0u8; cipher_size];
        let written = public.encrypt(&plain, &mut cipher, padding).unwrap();
        assert_eq!(written, cipher_size);

        let mut decrypted = vec![0u8; cipher_size];
        let size = key.decrypt(&cipher, &mut decrypted, padding).unwrap();
        assert_eq!(&decrypted[..size], &plain[..]);
    }

    #[test]
    fn cipher_text_size() {
        let key = test_key();
        let public = key.public_key();
        let padding = RsaPadding::OaepSha1;
        let block = public.plain_text_block_size(padding);
        assert_eq!(
            public.calculate_cipher_text_size(block, padding),
            public.size()
        );
        assert_eq!(
            public.calculate_cipher_text_size(block + 1, padding),
            2 * public.size()
        );
    }
}
