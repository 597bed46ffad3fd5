//! Admin authentication and guest enrollment.
//!
//! Admin login exchanges a password for an admin session token, verified
//! against an Argon2id hash. Guest enrollment is QR-based: an admin
//! generates a short-lived one-time code bound to a permission set; the
//! guest presents it once and receives a guest token. Both paths are rate
//! limited per IP and audited.

use crate::security::audit::{AuditEvent, AuditLogger, AuditRecord};
use crate::security::policy::{AccessControl, Action, Role};
use crate::security::rate_limit::RateLimiter;
use crate::security::tokens::{Claims, TokenFailure, TokenService};
use crate::{current_timestamp, Error, Result};
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::instrument;

/// Argon2 parameters, surfaced through configuration because the KDF cost
/// is a deployment decision.
#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Iteration count.
    pub iterations: u32,
    /// Lane count.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // argon2 crate defaults (OWASP-aligned): 19 MiB, 2 passes, 1 lane.
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Validates the password complexity rules, applied on set (never on
/// verify): at least 12 characters with upper, lower, digit, and
/// non-alphanumeric classes all present.
pub fn check_password_policy(password: &str) -> Result<()> {
    if password.chars().count() < 12 {
        return Err(Error::InvalidArgument(
            "password must be at least 12 characters".to_string(),
        ));
    }
    let has_upper = password.chars().any(char::is_uppercase);
    let has_lower = password.chars().any(char::is_lowercase);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_other = password.chars().any(|c| !c.is_alphanumeric());
    if has_upper && has_lower && has_digit && has_other {
        Ok(())
    } else {
        Err(Error::InvalidArgument(
            "password needs upper, lower, digit, and non-alphanumeric characters".to_string(),
        ))
    }
}

/// Hashes a password into PHC string format with Argon2id.
pub fn hash_password(password: &str, params: KdfParams) -> Result<String> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    check_password_policy(password)?;
    let argon2 = argon2_with(params)?;
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::OperationFailed {
            operation: "hash_password".to_string(),
            cause: e.to_string(),
        })
}

/// Verifies a password against a PHC hash string. The stored parameters
/// inside the hash govern the verification cost.
pub fn verify_password(password: &str, phc_hash: &str) -> Result<bool> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let parsed = PasswordHash::new(phc_hash).map_err(|e| Error::OperationFailed {
        operation: "parse_password_hash".to_string(),
        cause: e.to_string(),
    })?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn argon2_with(params: KdfParams) -> Result<argon2::Argon2<'static>> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let params = Params::new(params.memory_kib, params.iterations, params.parallelism, None)
        .map_err(|e| Error::InvalidArgument(format!("bad KDF parameters: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// A pending guest grant, keyed by the SHA-256 digest of its one-time code.
#[derive(Debug, Clone)]
struct GuestGrant {
    permissions: Vec<String>,
    issued_by: String,
    qr_generation: String,
    token_ttl: Duration,
    expires_at: u64,
    used: bool,
}

/// The enrollment artifact handed to the admin for display as a QR code.
#[derive(Debug, Clone, Serialize)]
pub struct GuestQr {
    /// The one-time code (also embedded in `payload`).
    pub code: String,
    /// Generation id; issued tokens reference it.
    pub qr_generation: String,
    /// Base64 JSON payload for the QR image: code, server identity,
    /// granted permissions, expiry.
    pub payload: String,
    /// Unix seconds after which the code is dead.
    pub expires_at: u64,
}

fn acquire<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn code_digest(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Authentication service: login, enrollment, token verification, and the
/// policy enforcement point.
pub struct AuthService {
    admin_hash: SecretString,
    tokens: TokenService,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLogger>,
    policy: AccessControl,
    server_id: String,
    admin_token_ttl: Duration,
    pending_codes: Mutex<HashMap<String, GuestGrant>>,
}

impl AuthService {
    /// Creates the service.
    pub fn new(
        admin_hash: SecretString,
        signing_key: &SecretString,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditLogger>,
        policy: AccessControl,
        server_id: impl Into<String>,
        admin_token_ttl: Duration,
    ) -> Result<Self> {
        Ok(Self {
            admin_hash,
            tokens: TokenService::new(signing_key)?,
            rate_limiter,
            audit,
            policy,
            server_id: server_id.into(),
            admin_token_ttl,
            pending_codes: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the access policy.
    #[must_use]
    pub fn policy(&self) -> &AccessControl {
        &self.policy
    }

    /// Exchanges the admin password for a session token.
    ///
    /// Rate limited per IP with progressive delay; failures and lockouts
    /// are audited.
    #[instrument(skip(self, password))]
    pub async fn admin_login(&self, password: &str, client_ip: IpAddr) -> Result<String> {
        self.take_rate_slot(client_ip, "admin_login").await?;

        let password = password.to_string();
        let hash = self.admin_hash.expose_secret().to_string();
        // The KDF is intentionally slow; keep it off the async workers.
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| Error::OperationFailed {
                operation: "verify_password".to_string(),
                cause: e.to_string(),
            })??;

        if !verified {
            self.audit.emit(
                AuditRecord::new(AuditEvent::AuthFailure, "admin_login")
                    .with_ip(client_ip)
                    .with_subject("admin"),
            );
            return Err(Error::Unauthorized("bad credentials".to_string()));
        }

        let (token, claims) = self.tokens.issue_admin("admin", self.admin_token_ttl)?;
        self.audit.emit(
            AuditRecord::new(AuditEvent::AuthSuccess, "admin_login")
                .with_ip(client_ip)
                .with_subject("admin"),
        );
        self.audit.emit(
            AuditRecord::new(AuditEvent::TokenIssued, "admin_login")
                .with_ip(client_ip)
                .with_subject(&claims.sub)
                .with_detail("jti", claims.jti.as_str())
                .with_detail("role", "admin"),
        );
        Ok(token)
    }

    /// Generates a guest enrollment QR. Admin only.
    #[instrument(skip(self, claims))]
    pub fn generate_guest_qr(
        &self,
        claims: &Claims,
        permissions: Vec<String>,
        ttl: Duration,
        client_ip: IpAddr,
    ) -> Result<GuestQr> {
        self.enforce(claims, Action::IssueGuestAccess, client_ip)?;

        let code = uuid::Uuid::new_v4().to_string();
        let qr_generation = uuid::Uuid::new_v4().to_string();
        let expires_at = current_timestamp().saturating_add(ttl.as_secs());

        let payload_json = serde_json::json!({
            "server_id": self.server_id,
            "code": code,
            "permissions": permissions,
            "expires_at": expires_at,
        });
        let payload =
            base64::engine::general_purpose::STANDARD.encode(payload_json.to_string());

        acquire(&self.pending_codes).insert(
            code_digest(&code),
            GuestGrant {
                permissions: permissions.clone(),
                issued_by: claims.sub.clone(),
                qr_generation: qr_generation.clone(),
                token_ttl: ttl,
                expires_at,
                used: false,
            },
        );

        self.audit.emit(
            AuditRecord::new(AuditEvent::GuestQrGenerated, "generate_guest_qr")
                .with_ip(client_ip)
                .with_subject(&claims.sub)
                .with_detail("qr_generation", qr_generation.as_str())
                .with_detail(
                    "permissions",
                    crate::models::Value::List(
                        permissions.iter().map(|p| p.as_str().into()).collect(),
                    ),
                ),
        );

        Ok(GuestQr {
            code,
            qr_generation,
            payload,
            expires_at,
        })
    }

    /// Redeems a one-time enrollment code for a guest token. Codes are
    /// single-use: presentation after first use or after expiry is refused.
    #[instrument(skip(self, code))]
    pub async fn redeem_guest_code(&self, code: &str, client_ip: IpAddr) -> Result<String> {
        self.take_rate_slot(client_ip, "redeem_guest_code").await?;

        let digest = code_digest(code);
        let grant = {
            let mut pending = acquire(&self.pending_codes);
            match pending.get_mut(&digest) {
                None => None,
                Some(grant) if grant.used => None,
                Some(grant) if grant.expires_at <= current_timestamp() => None,
                Some(grant) => {
                    grant.used = true;
                    Some(grant.clone())
                },
            }
        };

        let Some(grant) = grant else {
            self.audit.emit(
                AuditRecord::new(AuditEvent::AuthFailure, "redeem_guest_code")
                    .with_ip(client_ip)
                    .with_detail("reason", "unknown, used, or expired code"),
            );
            return Err(Error::Unauthorized(
                "enrollment code is unknown, used, or expired".to_string(),
            ));
        };

        let guest_id = format!("guest-{}", &grant.qr_generation[..8.min(grant.qr_generation.len())]);
        let (token, claims) = self.tokens.issue_guest(
            &guest_id,
            grant.permissions,
            grant.token_ttl,
            &grant.issued_by,
            &grant.qr_generation,
        )?;

        self.audit.emit(
            AuditRecord::new(AuditEvent::GuestTokenIssued, "redeem_guest_code")
                .with_ip(client_ip)
                .with_subject(&claims.sub)
                .with_detail("qr_generation", grant.qr_generation.as_str())
                .with_detail("jti", claims.jti.as_str()),
        );
        Ok(token)
    }

    /// Verifies a bearer `Authorization` header and returns the claims.
    /// Every outcome is audited under its own event kind.
    #[instrument(skip(self, auth_header))]
    pub fn verify_token(&self, auth_header: &str, client_ip: IpAddr) -> Result<Claims> {
        match self.tokens.verify_header(auth_header) {
            Ok(claims) => {
                self.audit.emit(
                    AuditRecord::new(AuditEvent::TokenVerified, "verify_token")
                        .with_ip(client_ip)
                        .with_subject(&claims.sub),
                );
                Ok(claims)
            },
            Err(TokenFailure::RefusedAlgorithm(alg)) => {
                self.audit.emit(
                    AuditRecord::new(
                        AuditEvent::SuspiciousInvalidAlgorithm,
                        "verify_token",
                    )
                    .with_ip(client_ip)
                    .with_detail("algorithm", alg.as_str()),
                );
                Err(TokenFailure::RefusedAlgorithm(alg).into())
            },
            Err(TokenFailure::Expired) => {
                self.audit.emit(
                    AuditRecord::new(AuditEvent::TokenExpired, "verify_token")
                        .with_ip(client_ip),
                );
                Err(TokenFailure::Expired.into())
            },
            Err(failure) => {
                self.audit.emit(
                    AuditRecord::new(AuditEvent::TokenInvalid, "verify_token")
                        .with_ip(client_ip),
                );
                Err(failure.into())
            },
        }
    }

    /// The enforcement point: refuses unless the subject's role grants the
    /// action and, for guests, the token's permission claims include it.
    #[instrument(skip(self, claims), fields(subject = %claims.sub, action = %action))]
    pub fn enforce(&self, claims: &Claims, action: Action, client_ip: IpAddr) -> Result<()> {
        let permitted = self.policy.allows(claims.role, action)
            && claims.has_permission(action.required_permission());

        if !permitted {
            self.audit.emit(
                AuditRecord::new(AuditEvent::AccessDenied, action.as_str())
                    .with_ip(client_ip)
                    .with_subject(&claims.sub)
                    .with_detail("role", claims.role.as_str()),
            );
            return Err(Error::PermissionDenied {
                action: action.to_string(),
                role: claims.role.to_string(),
            });
        }

        self.audit.emit(
            AuditRecord::new(AuditEvent::AccessGranted, action.as_str())
                .with_ip(client_ip)
                .with_subject(&claims.sub),
        );
        if claims.role == Role::Guest {
            self.audit.emit(
                AuditRecord::new(AuditEvent::GuestAccess, action.as_str())
                    .with_ip(client_ip)
                    .with_subject(&claims.sub),
            );
        }
        Ok(())
    }

    /// Registers a rate-limited attempt; sleeps the progressive delay.
    async fn take_rate_slot(&self, client_ip: IpAddr, operation: &str) -> Result<()> {
        match self.rate_limiter.check(client_ip) {
            Ok(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(())
            },
            Err(limited) => {
                let event = if limited.newly_locked {
                    AuditEvent::AuthLockout
                } else {
                    AuditEvent::SuspiciousRateLimit
                };
                self.audit.emit(
                    AuditRecord::new(event, operation)
                        .with_ip(client_ip)
                        .with_detail("retry_after_secs", i64::try_from(limited.retry_after_secs).unwrap_or(i64::MAX)),
                );
                Err(limited.into())
            },
        }
    }
}
