// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Hashing primitives: HMAC signing / verification and the P-SHA pseudo random function used
//! to derive symmetric keys from the channel nonces (Part 6, 6.7.5).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use uasc_types::{Error, StatusCode};

type HmacSha256 = Hmac<Sha256>;

/// The P_SHA256 pseudo random function. Generates `length` bytes from `secret` and `seed`:
///
/// ```text
/// P_SHA(secret, seed) = HMAC(secret, A(1) + seed) + HMAC(secret, A(2) + seed) + ...
/// ```
///
/// where `A(0) = seed` and `A(n) = HMAC(secret, A(n-1))`.
pub fn p_sha256(secret: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(length);
    let mut a = hmac_sha256_vec(secret, seed);
    while result.len() < length {
        let mut input = a.clone();
        input.extend_from_slice(seed);
        let hashed = hmac_sha256_vec(secret, &input);
        result.extend_from_slice(&hashed);
        a = hmac_sha256_vec(secret, &a);
    }
    result.truncate(length);
    result
}

fn hmac_sha256_vec(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sign `data` with HMAC-SHA256, writing the 32 byte tag into `signature`.
pub fn hmac_sha256(key: &[u8], data: &[u8], signature: &mut [u8]) -> Result<(), Error> {
    if signature.len() != 32 {
        return Err(Error::new(
            StatusCode::BadSecurityChecksFailed,
            format!("Signature buffer has wrong size {}", signature.len()),
        ));
    }
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))?;
    mac.update(data);
    signature.copy_from_slice(&mac.finalize().into_bytes());
    Ok(())
}

/// Verify an HMAC-SHA256 tag in constant time.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), Error> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::new(StatusCode::BadSecurityChecksFailed, e.to_string()))?;
    mac.update(data);
    mac.verify_slice(signature).map_err(|_| {
        Error::new(
            StatusCode::BadSecurityChecksFailed,
            "HMAC signature verification failed",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p_sha256_is_deterministic_and_sized() {
        let secret = b"the quick brown fox";
        let seed = b"jumps over the lazy dog";
        let a = p_sha256(secret, seed, 80);
        let b = p_sha256(secret, seed, 80);
        assert_eq!(a.len(), 80);
        assert_eq!(a, b);

        // A prefix of a longer expansion equals the shorter expansion.
        let c = p_sha256(secret, seed, 32);
        assert_eq!(&a[..32], &c[..]);

        // Different seeds diverge.
        let d = p_sha256(secret, b"other seed", 80);
        assert_ne!(a, d);
    }

    #[test]
    fn hmac_round_trip() {
        let key = [7u8; 32];
        let mut signature = [0u8; 32];
        hmac_sha256(&key, b"payload", &mut signature).unwrap();
        verify_hmac_sha256(&key, b"payload", &signature).unwrap();
        assert!(verify_hmac_sha256(&key, b"tampered", &signature).is_err());
    }
}
