//! Security core: authentication, authorization, rate limiting, auditing.

pub mod audit;
pub mod auth;
pub mod policy;
pub mod rate_limit;
pub mod tokens;

pub use audit::{AuditEvent, AuditLogger, AuditRecord, AuditSink, PatternAlert, PatternConfig, Severity};
pub use auth::{check_password_policy, hash_password, verify_password, AuthService, GuestQr, KdfParams};
pub use policy::{AccessControl, Action, Role};
pub use rate_limit::{RateLimitConfig, RateLimited, RateLimiter};
pub use tokens::{Claims, TokenFailure, TokenService};
