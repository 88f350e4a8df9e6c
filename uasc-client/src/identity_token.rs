// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! User identity tokens supplied at session activation, and the encoding / encryption they
//! need on the way out.

use uasc_crypto::{KeySize, SecurityPolicy, X509};
use uasc_types::{
    AnonymousIdentityToken, ByteString, Error, ExtensionObject, IssuedIdentityToken, ObjectId,
    StatusCode, UAString, UserNameIdentityToken, UserTokenPolicy, UserTokenType,
    X509IdentityToken,
};

/// URI of the RSA-OAEP encryption algorithm, used to tag encrypted password fields.
const RSA_OAEP_URI: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep";

/// The user identity the client activates its session with.
#[derive(Debug, Clone, Default)]
pub enum IdentityToken {
    /// No identity.
    #[default]
    Anonymous,
    /// User name and password.
    UserName(String, String),
    /// An X509 user certificate in DER form.
    Certificate(ByteString),
    /// A token issued by an external authority.
    IssuedToken(ByteString),
}

impl IdentityToken {
    /// The wire token type this identity answers.
    pub fn token_type(&self) -> UserTokenType {
        match self {
            IdentityToken::Anonymous => UserTokenType::Anonymous,
            IdentityToken::UserName(_, _) => UserTokenType::UserName,
            IdentityToken::Certificate(_) => UserTokenType::Certificate,
            IdentityToken::IssuedToken(_) => UserTokenType::IssuedToken,
        }
    }

    /// Encode the identity into the extension object carried by ActivateSession.
    ///
    /// When `channel_policy` carries cryptography, secrets (the password or issued token)
    /// are encrypted with the server certificate using the legacy secret format: a 4 byte
    /// length prefix, the secret, then the server nonce, RSA-encrypted as one blob.
    pub fn make_user_identity_token(
        &self,
        policy: &UserTokenPolicy,
        channel_policy: SecurityPolicy,
        server_certificate: Option<&X509>,
        server_nonce: &[u8],
    ) -> Result<ExtensionObject, Error> {
        let policy_id = policy.policy_id.clone();
        match self {
            IdentityToken::Anonymous => {
                let token = AnonymousIdentityToken { policy_id };
                Ok(ExtensionObject::from_message(
                    ObjectId::AnonymousIdentityToken_Encoding_DefaultBinary,
                    &token,
                ))
            }
            IdentityToken::UserName(user_name, password) => {
                let (password, encryption_algorithm) = encrypt_secret(
                    password.as_bytes(),
                    channel_policy,
                    server_certificate,
                    server_nonce,
                )?;
                let token = UserNameIdentityToken {
                    policy_id,
                    user_name: UAString::from(user_name.as_str()),
                    password,
                    encryption_algorithm,
                };
                Ok(ExtensionObject::from_message(
                    ObjectId::UserNameIdentityToken_Encoding_DefaultBinary,
                    &token,
                ))
            }
            IdentityToken::Certificate(certificate_data) => {
                let token = X509IdentityToken {
                    policy_id,
                    certificate_data: certificate_data.clone(),
                };
                Ok(ExtensionObject::from_message(
                    ObjectId::X509IdentityToken_Encoding_DefaultBinary,
                    &token,
                ))
            }
            IdentityToken::IssuedToken(token_data) => {
                let (token_data, encryption_algorithm) = encrypt_secret(
                    token_data.as_ref(),
                    channel_policy,
                    server_certificate,
                    server_nonce,
                )?;
                let token = IssuedIdentityToken {
                    policy_id,
                    token_data,
                    encryption_algorithm,
                };
                Ok(ExtensionObject::from_message(
                    ObjectId::IssuedIdentityToken_Encoding_DefaultBinary,
                    &token,
                ))
            }
        }
    }
}

/// Encrypt a secret for transport inside an identity token. Under the `None` policy the
/// secret travels in the clear and the algorithm is null.
fn encrypt_secret(
    secret: &[u8],
    channel_policy: SecurityPolicy,
    server_certificate: Option<&X509>,
    server_nonce: &[u8],
) -> Result<(ByteString, UAString), Error> {
    if channel_policy == SecurityPolicy::None {
        return Ok((ByteString::from(secret), UAString::null()));
    }

    let Some(certificate) = server_certificate else {
        return Err(Error::new(
            StatusCode::BadCertificateInvalid,
            "Cannot encrypt an identity secret without the server certificate",
        ));
    };
    let key = certificate.public_key()?;

    // Legacy secret format: length prefix, secret, server nonce.
    let mut plain = Vec::with_capacity(4 + secret.len() + server_nonce.len());
    plain.extend_from_slice(&((secret.len() + server_nonce.len()) as u32).to_le_bytes());
    plain.extend_from_slice(secret);
    plain.extend_from_slice(server_nonce);

    let padding = channel_policy.asymmetric_encryption_padding();
    let mut cipher = vec![0u8; key.calculate_cipher_text_size(plain.len(), padding)];
    let size = key.encrypt(&plain, &mut cipher, padding)?;
    cipher.truncate(size);
    Ok((ByteString::from(cipher), UAString::from(RSA_OAEP_URI)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uasc_types::DecodingOptions;

    fn policy() -> UserTokenPolicy {
        UserTokenPolicy {
            policy_id: UAString::from("anonymous"),
            token_type: UserTokenType::Anonymous,
            ..Default::default()
        }
    }

    #[test]
    fn anonymous_token() {
        let token = IdentityToken::Anonymous
            .make_user_identity_token(&policy(), SecurityPolicy::None, None, &[])
            .unwrap();
        assert_eq!(
            token.object_id().unwrap(),
            ObjectId::AnonymousIdentityToken_Encoding_DefaultBinary
        );
        let inner: AnonymousIdentityToken =
            token.decode_inner(&DecodingOptions::default()).unwrap();
        assert_eq!(inner.policy_id, UAString::from("anonymous"));
    }

    #[test]
    fn plaintext_password_under_policy_none() {
        let identity = IdentityToken::UserName("user".into(), "secret".into());
        let token = identity
            .make_user_identity_token(&policy(), SecurityPolicy::None, None, &[])
            .unwrap();
        let inner: UserNameIdentityToken =
            token.decode_inner(&DecodingOptions::default()).unwrap();
        assert_eq!(inner.password.as_ref(), b"secret");
        assert!(inner.encryption_algorithm.is_null());
    }

    #[test]
    fn password_encrypted_under_crypto_policy() {
        let key = uasc_crypto::PrivateKey::new(2048).unwrap();
        let cert = X509::self_signed(&key, "server", 1).unwrap();
        let identity = IdentityToken::UserName("user".into(), "secret".into());
        let nonce = [5u8; 32];
        let token = identity
            .make_user_identity_token(
                &policy(),
                SecurityPolicy::Basic256Sha256,
                Some(&cert),
                &nonce,
            )
            .unwrap();
        let inner: UserNameIdentityToken =
            token.decode_inner(&DecodingOptions::default()).unwrap();
        assert!(!inner.encryption_algorithm.is_null());
        assert_ne!(inner.password.as_ref(), b"secret");

        // The server can round it back with its private key.
        let padding = SecurityPolicy::Basic256Sha256.asymmetric_encryption_padding();
        let mut plain = vec![0u8; inner.password.len()];
        let size = key
            .decrypt(inner.password.as_ref(), &mut plain, padding)
            .unwrap();
        let length = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) as usize;
        assert_eq!(length, "secret".len() + nonce.len());
        assert_eq!(&plain[4..4 + "secret".len()], b"secret");
        assert_eq!(&plain[4 + "secret".len()..size], &nonce);
    }
}
