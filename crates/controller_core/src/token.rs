//! Signed tokens for authentication and session resumption.
//!
//! Tokens use the familiar three-part JWT layout
//! `base64url(header).base64url(claims).base64url(mac)` with an HMAC-SHA256
//! signature. Every token carries an audience (`aud`) and an issue time
//! (`iat`, milliseconds since the Unix epoch) alongside its typed claims.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::utils::current_timestamp_ms;

type HmacSha256 = Hmac<Sha256>;

/// Audience of host authentication tokens.
pub const HOST_AUDIENCE: &str = "host";
/// Audience of user (control client) authentication tokens.
pub const USER_AUDIENCE: &str = "user";

/// Audience of session tokens issued by the controller run started at `started_at_ms`.
pub fn session_audience(started_at_ms: u64) -> String {
    format!("session.{started_at_ms}")
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not match")]
    BadSignature,
    #[error("token audience {found:?} does not match {expected:?}")]
    WrongAudience { expected: String, found: String },
    #[error("token claims are invalid: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("signing key is empty")]
    EmptyKey,
}

/// Claims of a host authentication token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostClaims {
    pub host: u32,
}

/// Claims of a user authentication token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserClaims {
    pub user: String,
}

/// Claims of a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sid: u64,
}

/// Verified token contents.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Claims<T> {
    pub aud: String,
    pub iat: u64,
    #[serde(flatten)]
    pub body: T,
}

#[derive(Serialize)]
struct ClaimsRef<'a, T> {
    aud: &'a str,
    iat: u64,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Signs and verifies tokens with one shared secret.
pub struct TokenSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, TokenError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TokenError::EmptyKey);
        }
        Ok(Self { key })
    }

    /// Signs `body` for `audience`, issued now.
    pub fn sign<T: Serialize>(&self, body: &T, audience: &str) -> Result<String, TokenError> {
        self.sign_at(body, audience, current_timestamp_ms())
    }

    /// Signs `body` for `audience` with an explicit issue time.
    pub fn sign_at<T: Serialize>(
        &self,
        body: &T,
        audience: &str,
        issued_at_ms: u64,
    ) -> Result<String, TokenError> {
        let header = Header {
            alg: "HS256".into(),
            typ: "JWT".into(),
        };
        let claims = ClaimsRef {
            aud: audience,
            iat: issued_at_ms,
            body,
        };

        let mut token = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        token.push('.');
        token.push_str(&URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?));

        let signature = self.mac(token.as_bytes())?.finalize().into_bytes();
        token.push('.');
        token.push_str(&URL_SAFE_NO_PAD.encode(signature));
        Ok(token)
    }

    /// Checks the signature and audience of `token` and decodes its claims.
    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        audience: &str,
    ) -> Result<Claims<T>, TokenError> {
        let (signed, signature) = token.rsplit_once('.').ok_or(TokenError::Malformed)?;
        let (_, encoded_claims) = signed.split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;

        self.mac(signed.as_bytes())?
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let raw_claims = URL_SAFE_NO_PAD
            .decode(encoded_claims)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims<T> = serde_json::from_slice(&raw_claims)?;
        if claims.aud != audience {
            return Err(TokenError::WrongAudience {
                expected: audience.to_string(),
                found: claims.aud,
            });
        }
        Ok(claims)
    }

    /// Authentication token for host `host_id`, issued now.
    pub fn host_token(&self, host_id: u32) -> Result<String, TokenError> {
        self.sign(&HostClaims { host: host_id }, HOST_AUDIENCE)
    }

    /// Authentication token for the user `name`, issued now.
    pub fn user_token(&self, name: &str) -> Result<String, TokenError> {
        self.sign(&UserClaims { user: name.to_string() }, USER_AUDIENCE)
    }

    fn mac(&self, payload: &[u8]) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| TokenError::EmptyKey)?;
        mac.update(payload);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"test secret".to_vec()).unwrap()
    }

    #[test]
    fn test_sign_and_verify_host_token() {
        let signer = signer();
        let token = signer.sign_at(&HostClaims { host: 4 }, HOST_AUDIENCE, 1234).unwrap();

        let claims: Claims<HostClaims> = signer.verify(&token, HOST_AUDIENCE).unwrap();
        assert_eq!(claims.body.host, 4);
        assert_eq!(claims.iat, 1234);
        assert_eq!(claims.aud, HOST_AUDIENCE);
    }

    #[test]
    fn test_wrong_audience_is_rejected() {
        let signer = signer();
        let token = signer
            .sign(&UserClaims { user: "alice".into() }, USER_AUDIENCE)
            .unwrap();

        let result = signer.verify::<UserClaims>(&token, HOST_AUDIENCE);
        assert!(matches!(result, Err(TokenError::WrongAudience { .. })));
    }

    #[test]
    fn test_previous_run_session_tokens_are_rejected() {
        let signer = signer();
        let token = signer
            .sign(&SessionClaims { sid: 1 }, &session_audience(1000))
            .unwrap();

        assert!(signer.verify::<SessionClaims>(&token, &session_audience(1000)).is_ok());
        assert!(signer.verify::<SessionClaims>(&token, &session_audience(2000)).is_err());
    }

    #[test]
    fn test_foreign_key_and_tampering_are_rejected() {
        let token = signer().sign(&HostClaims { host: 1 }, HOST_AUDIENCE).unwrap();

        let other = TokenSigner::new(b"other secret".to_vec()).unwrap();
        assert!(matches!(
            other.verify::<HostClaims>(&token, HOST_AUDIENCE),
            Err(TokenError::BadSignature)
        ));

        let forged_claims = URL_SAFE_NO_PAD.encode(br#"{"aud":"host","iat":0,"host":99}"#);
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged_claims;
        let forged = parts.join(".");
        assert!(matches!(
            signer().verify::<HostClaims>(&forged, HOST_AUDIENCE),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn test_convenience_tokens_carry_their_subject() {
        let signer = signer();
        let host: Claims<HostClaims> = signer
            .verify(&signer.host_token(12).unwrap(), HOST_AUDIENCE)
            .unwrap();
        assert_eq!(host.body.host, 12);

        let user: Claims<UserClaims> = signer
            .verify(&signer.user_token("alice").unwrap(), USER_AUDIENCE)
            .unwrap();
        assert_eq!(user.body.user, "alice");
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            signer().verify::<HostClaims>("garbage", HOST_AUDIENCE),
            Err(TokenError::Malformed)
        ));
        assert!(TokenSigner::new(Vec::new()).is_err());
    }
}
