//! Signed, time-bounded credentials.
//!
//! Two classes are issued: short-lived access tokens for ordinary API calls
//! and long-lived refresh tokens that can only mint a new pair. Both are HS256
//! JWTs signed with the process-wide secret from [`TokenConfig`].

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use murmur_types::models::Subject;

pub const DEFAULT_ACCESS_TTL_MINUTES: i64 = 15;
pub const DEFAULT_REFRESH_TTL_HOURS: i64 = 24;

/// Signing secret, issuer name and validity window per class.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl TokenConfig {
    pub fn new(secret: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: issuer.into(),
            access_ttl: Duration::minutes(DEFAULT_ACCESS_TTL_MINUTES),
            refresh_ttl: Duration::hours(DEFAULT_REFRESH_TTL_HOURS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenClass {
    Access,
    Refresh,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("malformed token")]
    Malformed,
    #[error("failed to sign token")]
    Encoding,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    username: String,
    full_name: String,
    iss: String,
    iat: i64,
    exp: i64,
    jti: Uuid,
    typ: TokenClass,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub subject: Subject,
    pub class: TokenClass,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerifiedToken {
    /// True while `now` is strictly before the embedded expiry.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

impl TokenIssuer {
    pub fn new(config: &TokenConfig) -> Self {
        // HS256 only: a header naming any other algorithm is rejected.
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is the caller's decision (refresh accepts expired JWTs).
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.set_issuer(&[config.issuer.as_str()]);

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
        }
    }

    pub fn ttl(&self, class: TokenClass) -> Duration {
        match class {
            TokenClass::Access => self.access_ttl,
            TokenClass::Refresh => self.refresh_ttl,
        }
    }

    pub fn issue(
        &self,
        subject: &Subject,
        class: TokenClass,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let iat = now.timestamp();
        let exp = iat + self.ttl(class).num_seconds();

        let claims = Claims {
            username: subject.username.clone(),
            full_name: subject.full_name.clone(),
            iss: self.issuer.clone(),
            iat,
            exp,
            jti: Uuid::new_v4(),
            typ: class,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| TokenError::Encoding)?;

        Ok(IssuedToken {
            token,
            expires_at: from_secs(exp)?,
        })
    }

    /// Check signature, algorithm and issuer, and decode the claims.
    /// Does not reject expired tokens.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidAlgorithmName => TokenError::InvalidSignature,
                _ => TokenError::Malformed,
            }
        })?;
        let claims = data.claims;

        Ok(VerifiedToken {
            subject: Subject {
                username: claims.username,
                full_name: claims.full_name,
            },
            class: claims.typ,
            issued_at: from_secs(claims.iat)?,
            expires_at: from_secs(claims.exp)?,
        })
    }
}

fn from_secs(secs: i64) -> Result<DateTime<Utc>, TokenError> {
    DateTime::from_timestamp(secs, 0).ok_or(TokenError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(&TokenConfig::new("test-secret", "murmur-test"))
    }

    fn alice() -> Subject {
        Subject {
            username: "alice01".into(),
            full_name: "Alice Liddell".into(),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn access_token_expires_after_fifteen_minutes() {
        let tokens = issuer();
        let now = fixed_now();

        let issued = tokens.issue(&alice(), TokenClass::Access, now).unwrap();
        assert_eq!(issued.expires_at, now + Duration::minutes(15));

        let verified = tokens.verify(&issued.token).unwrap();
        assert_eq!(verified.subject, alice());
        assert_eq!(verified.class, TokenClass::Access);
        assert_eq!(verified.issued_at, now);
        assert_eq!(verified.expires_at, now + Duration::minutes(15));
    }

    #[test]
    fn refresh_token_expires_after_a_day() {
        let tokens = issuer();
        let now = fixed_now();

        let issued = tokens.issue(&alice(), TokenClass::Refresh, now).unwrap();
        let verified = tokens.verify(&issued.token).unwrap();
        assert_eq!(verified.expires_at, now + Duration::hours(24));
        assert_eq!(verified.class, TokenClass::Refresh);
    }

    #[test]
    fn expired_token_still_verifies() {
        let tokens = issuer();
        // fixed_now() is long past, so this token is expired in wall-clock terms
        let issued = tokens.issue(&alice(), TokenClass::Access, fixed_now()).unwrap();

        let verified = tokens.verify(&issued.token).unwrap();
        assert!(!verified.is_live_at(Utc::now()));
        assert!(verified.is_live_at(fixed_now()));
        assert!(!verified.is_live_at(fixed_now() + Duration::minutes(15)));
    }

    #[test]
    fn same_second_tokens_are_distinct() {
        let tokens = issuer();
        let a = tokens.issue(&alice(), TokenClass::Access, fixed_now()).unwrap();
        let b = tokens.issue(&alice(), TokenClass::Access, fixed_now()).unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let other = TokenIssuer::new(&TokenConfig::new("other-secret", "murmur-test"));
        let issued = other.issue(&alice(), TokenClass::Access, fixed_now()).unwrap();

        assert_eq!(issuer().verify(&issued.token).unwrap_err(), TokenError::InvalidSignature);
    }

    #[test]
    fn other_algorithm_is_rejected() {
        let claims = Claims {
            username: "mallory".into(),
            full_name: "Mallory Mallory".into(),
            iss: "murmur-test".into(),
            iat: fixed_now().timestamp(),
            exp: fixed_now().timestamp() + 60,
            jti: Uuid::new_v4(),
            typ: TokenClass::Access,
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        assert_eq!(issuer().verify(&token).unwrap_err(), TokenError::InvalidSignature);
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let other = TokenIssuer::new(&TokenConfig::new("test-secret", "someone-else"));
        let issued = other.issue(&alice(), TokenClass::Access, fixed_now()).unwrap();

        assert_eq!(issuer().verify(&issued.token).unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(issuer().verify("not-a-jwt").unwrap_err(), TokenError::Malformed);
        assert_eq!(issuer().verify("").unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let tokens = issuer();
        let issued = tokens.issue(&alice(), TokenClass::Access, fixed_now()).unwrap();
        let mut parts: Vec<&str> = issued.token.split('.').collect();
        let other = tokens
            .issue(
                &Subject {
                    username: "mallory".into(),
                    full_name: "Mallory Mallory".into(),
                },
                TokenClass::Access,
                fixed_now(),
            )
            .unwrap();
        let other_parts: Vec<&str> = other.token.split('.').collect();
        parts[1] = other_parts[1];

        assert_eq!(tokens.verify(&parts.join(".")).unwrap_err(), TokenError::InvalidSignature);
    }
}
