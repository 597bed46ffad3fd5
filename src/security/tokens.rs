//! Signed session tokens.
//!
//! Tokens are HS256 JWTs under a single process-lifetime signing key.
//! Verification is stateless: signature plus `exp`. The algorithm
//! allowlist is exactly `HS256`; in particular the explicit `none`
//! algorithm is refused before any signature work happens, and that
//! refusal is distinguishable so callers can raise the corresponding
//! suspicious-activity audit event.

use crate::security::policy::Role;
use crate::{current_timestamp, Error};
use base64::Engine as _;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Minimum signing key length.
const MIN_KEY_LENGTH: usize = 32;

/// Session token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject id.
    pub sub: String,
    /// Subject role.
    pub role: Role,
    /// Issued-at (Unix seconds).
    pub iat: u64,
    /// Expiry (Unix seconds).
    pub exp: u64,
    /// Token id; guest tokens are bound to their QR generation through it.
    pub jti: String,
    /// Guest permission strings. Empty for admin tokens (the role grants
    /// everything).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Admin that issued this guest token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
    /// QR generation id this guest token was enrolled through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_generation: Option<String>,
}

impl Claims {
    /// Returns true if the claims carry `permission` (admins implicitly
    /// carry everything).
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Guest => self.permissions.iter().any(|p| p == permission),
        }
    }
}

/// Why verification refused a token.
#[derive(Debug)]
pub enum TokenFailure {
    /// The header names an algorithm outside the allowlist (including the
    /// explicit `none`).
    RefusedAlgorithm(String),
    /// Signature valid but `exp` is in the past.
    Expired,
    /// Anything else: bad signature, malformed token, wrong shape.
    Invalid(String),
}

impl fmt::Display for TokenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefusedAlgorithm(alg) => write!(f, "refused signing algorithm {alg}"),
            Self::Expired => write!(f, "token expired"),
            Self::Invalid(cause) => write!(f, "invalid token: {cause}"),
        }
    }
}

impl From<TokenFailure> for Error {
    fn from(failure: TokenFailure) -> Self {
        Self::Unauthorized(failure.to_string())
    }
}

/// Issues and verifies session tokens.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Creates a token service from the signing key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the key is shorter than 32 bytes.
    pub fn new(signing_key: &SecretString) -> crate::Result<Self> {
        let secret = signing_key.expose_secret();
        if secret.len() < MIN_KEY_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "signing key must be at least {MIN_KEY_LENGTH} bytes (got {})",
                secret.len()
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Issues an admin session token.
    pub fn issue_admin(&self, sub: &str, ttl: Duration) -> crate::Result<(String, Claims)> {
        let claims = self.base_claims(sub, Role::Admin, ttl);
        Ok((self.sign(&claims)?, claims))
    }

    /// Issues a guest token carrying the admin-chosen permissions.
    pub fn issue_guest(
        &self,
        sub: &str,
        permissions: Vec<String>,
        ttl: Duration,
        issued_by: &str,
        qr_generation: &str,
    ) -> crate::Result<(String, Claims)> {
        let mut claims = self.base_claims(sub, Role::Guest, ttl);
        claims.permissions = permissions;
        claims.issued_by = Some(issued_by.to_string());
        claims.qr_generation = Some(qr_generation.to_string());
        Ok((self.sign(&claims)?, claims))
    }

    fn base_claims(&self, sub: &str, role: Role, ttl: Duration) -> Claims {
        let now = current_timestamp();
        Claims {
            sub: sub.to_string(),
            role,
            iat: now,
            exp: now.saturating_add(ttl.as_secs()),
            jti: uuid::Uuid::new_v4().to_string(),
            permissions: Vec::new(),
            issued_by: None,
            qr_generation: None,
        }
    }

    fn sign(&self, claims: &Claims) -> crate::Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            Error::OperationFailed {
                operation: "sign_token".to_string(),
                cause: e.to_string(),
            }
        })
    }

    /// Verifies a token and returns its claims.
    pub fn verify(&self, token: &str) -> std::result::Result<Claims, TokenFailure> {
        // Inspect the header algorithm ourselves so a `none` (or any other
        // non-allowlisted) algorithm is refused explicitly rather than
        // failing as a generic parse error.
        let alg = header_algorithm(token)?;
        if alg != "HS256" {
            return Err(TokenFailure::RefusedAlgorithm(alg));
        }

        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(TokenFailure::Expired),
                _ => Err(TokenFailure::Invalid(e.to_string())),
            },
        }
    }

    /// Extracts and verifies a bearer token from an `Authorization` header.
    pub fn verify_header(&self, auth_header: &str) -> std::result::Result<Claims, TokenFailure> {
        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| TokenFailure::Invalid("malformed Authorization header".to_string()))?;
        self.verify(token)
    }
}

/// Reads the `alg` field out of a compact JWT header segment.
fn header_algorithm(token: &str) -> std::result::Result<String, TokenFailure> {
    let header_segment = token
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TokenFailure::Invalid("empty token".to_string()))?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(header_segment)
        .map_err(|e| TokenFailure::Invalid(format!("undecodable header: {e}")))?;
    let header: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| TokenFailure::Invalid(format!("unparsable header: {e}")))?;
    header
        .get("alg")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TokenFailure::Invalid("header missing alg".to_string()))
}
