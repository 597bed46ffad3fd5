//! Structured security audit log with suspicious-pattern detection.
//!
//! Events are line-delimited JSON. `auth.*` and `suspicious.*` events take
//! a synchronous flush path (they matter for compliance); everything else
//! goes through a bounded queue drained by a background task. A full queue
//! drops the oldest record and counts the drop rather than blocking the
//! request path.

use crate::models::{Value, ValueMap};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The fixed set of audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// Successful admin login.
    AuthSuccess,
    /// Failed admin login or guest code presentation.
    AuthFailure,
    /// An IP entered the rate-limit lockout.
    AuthLockout,
    /// A session token was issued.
    TokenIssued,
    /// A presented token verified.
    TokenVerified,
    /// A presented token had expired.
    TokenExpired,
    /// A presented token failed verification.
    TokenInvalid,
    /// A token was revoked.
    TokenRevoked,
    /// An operation was permitted.
    AccessGranted,
    /// An operation was refused by policy.
    AccessDenied,
    /// An admin generated a guest enrollment QR.
    GuestQrGenerated,
    /// A guest enrollment code was redeemed for a token.
    GuestTokenIssued,
    /// A guest performed an operation.
    GuestAccess,
    /// Attempts kept arriving while the IP was locked out.
    SuspiciousRateLimit,
    /// A token named a refused signing algorithm.
    SuspiciousInvalidAlgorithm,
}

impl AuditEvent {
    /// Returns the dotted event name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AuthSuccess => "auth.success",
            Self::AuthFailure => "auth.failure",
            Self::AuthLockout => "auth.lockout",
            Self::TokenIssued => "token.issued",
            Self::TokenVerified => "token.verified",
            Self::TokenExpired => "token.expired",
            Self::TokenInvalid => "token.invalid",
            Self::TokenRevoked => "token.revoked",
            Self::AccessGranted => "access.granted",
            Self::AccessDenied => "access.denied",
            Self::GuestQrGenerated => "guest.qr_generated",
            Self::GuestTokenIssued => "guest.token_issued",
            Self::GuestAccess => "guest.access",
            Self::SuspiciousRateLimit => "suspicious.rate_limit",
            Self::SuspiciousInvalidAlgorithm => "suspicious.invalid_algorithm",
        }
    }

    /// Default severity for the event kind.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::AuthSuccess
            | Self::TokenIssued
            | Self::TokenVerified
            | Self::AccessGranted
            | Self::GuestQrGenerated
            | Self::GuestTokenIssued
            | Self::GuestAccess => Severity::Info,
            Self::AuthFailure
            | Self::TokenExpired
            | Self::TokenInvalid
            | Self::TokenRevoked
            | Self::AccessDenied => Severity::Warning,
            Self::AuthLockout | Self::SuspiciousRateLimit | Self::SuspiciousInvalidAlgorithm => {
                Severity::Critical
            },
        }
    }

    /// `auth.*` and `suspicious.*` events bypass the queue and flush
    /// synchronously.
    #[must_use]
    pub const fn is_synchronous(&self) -> bool {
        matches!(
            self,
            Self::AuthSuccess
                | Self::AuthFailure
                | Self::AuthLockout
                | Self::SuspiciousRateLimit
                | Self::SuspiciousInvalidAlgorithm
        )
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine.
    Info,
    /// Worth attention.
    Warning,
    /// Security-relevant anomaly.
    Critical,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Event kind (serialized as the dotted name).
    #[serde(serialize_with = "serialize_event")]
    pub event: AuditEvent,
    /// Severity.
    pub severity: Severity,
    /// Client IP, when the event has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// Subject id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// Short request descriptor (operation or endpoint).
    pub request_info: String,
    /// Free-form detail map.
    #[serde(skip_serializing_if = "ValueMap::is_empty")]
    pub detail: ValueMap,
}

fn serialize_event<S: serde::Serializer>(
    event: &AuditEvent,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(event.as_str())
}

impl AuditRecord {
    /// Creates a record stamped now with the event's default severity.
    #[must_use]
    pub fn new(event: AuditEvent, request_info: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            severity: event.severity(),
            client_ip: None,
            subject_id: None,
            request_info: request_info.into(),
            detail: ValueMap::new(),
        }
    }

    /// Sets the client IP.
    #[must_use]
    pub const fn with_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Sets the subject id.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject_id = Some(subject.into());
        self
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

/// Where audit lines go.
#[derive(Debug, Clone)]
pub enum AuditSink {
    /// Append to a file.
    File(PathBuf),
    /// Write to stderr.
    Stderr,
}

/// Pattern detector configuration: raise after `threshold` matching events
/// inside `window`.
#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// K: events from one IP before a pattern fires.
    pub threshold: usize,
    /// N: how far back the detector looks.
    pub window: Duration,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(10 * 60),
        }
    }
}

/// A raised suspicious pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternAlert {
    /// ≥ K auth failures from one IP across several accounts.
    RepeatedAuthFailures {
        /// Offending IP.
        client_ip: IpAddr,
        /// Failure count in the window.
        count: usize,
        /// Distinct subjects targeted.
        accounts: usize,
    },
    /// ≥ K invalid tokens from one IP.
    RepeatedInvalidTokens {
        /// Offending IP.
        client_ip: IpAddr,
        /// Invalid-token count in the window.
        count: usize,
    },
    /// A login succeeded from an IP whose previous event was a lockout.
    SuccessAfterLockout {
        /// Offending IP.
        client_ip: IpAddr,
    },
}

fn acquire<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Audit logger with an async queue and a synchronous path for the
/// compliance-critical kinds.
pub struct AuditLogger {
    writer: Mutex<Box<dyn Write + Send>>,
    queue: Mutex<VecDeque<AuditRecord>>,
    queue_capacity: usize,
    dropped: AtomicU64,
    /// Recent events retained for the pattern detector.
    recent: Mutex<VecDeque<AuditRecord>>,
    pattern: PatternConfig,
}

impl AuditLogger {
    /// Creates a logger over `sink`. `queue_capacity` bounds the async
    /// queue; it should be sized to absorb a one-second burst.
    pub fn new(sink: &AuditSink, queue_capacity: usize) -> crate::Result<Self> {
        let writer: Box<dyn Write + Send> = match sink {
            AuditSink::File(path) => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| crate::Error::OperationFailed {
                        operation: "open_audit_sink".to_string(),
                        cause: e.to_string(),
                    })?,
            ),
            AuditSink::Stderr => Box::new(std::io::stderr()),
        };
        Ok(Self {
            writer: Mutex::new(writer),
            queue: Mutex::new(VecDeque::new()),
            queue_capacity: queue_capacity.max(1),
            dropped: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::new()),
            pattern: PatternConfig::default(),
        })
    }

    /// Overrides the pattern-detector configuration.
    #[must_use]
    pub fn with_pattern_config(mut self, pattern: PatternConfig) -> Self {
        self.pattern = pattern;
        self
    }

    /// Emits a record. Synchronous kinds flush immediately; the rest are
    /// queued (drop-oldest on overflow).
    pub fn emit(&self, record: AuditRecord) {
        metrics::counter!("homegraph_audit_events_total").increment(1);
        self.remember(&record);

        if record.event.is_synchronous() {
            self.write_line(&record);
            return;
        }

        let mut queue = acquire(&self.queue);
        if queue.len() >= self.queue_capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("homegraph_audit_dropped_total").increment(1);
        }
        queue.push_back(record);
    }

    /// Drains the async queue to the sink.
    pub fn flush(&self) {
        let drained: Vec<AuditRecord> = {
            let mut queue = acquire(&self.queue);
            queue.drain(..).collect()
        };
        for record in drained {
            self.write_line(&record);
        }
    }

    /// Number of records dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Scans the retained window and returns any raised patterns.
    #[must_use]
    pub fn scan_patterns(&self) -> Vec<PatternAlert> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.pattern.window)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let recent = acquire(&self.recent);
        detect_patterns(
            recent.iter().filter(|r| r.timestamp >= cutoff),
            self.pattern.threshold,
        )
    }

    /// Spawns the queue writer task (drains four times a second).
    pub fn spawn_writer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                logger.flush();
            }
        })
    }

    /// Spawns the pattern detector task.
    pub fn spawn_detector(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                for alert in logger.scan_patterns() {
                    metrics::counter!("homegraph_suspicious_patterns_total").increment(1);
                    tracing::warn!(?alert, "suspicious pattern detected");
                }
            }
        })
    }

    fn remember(&self, record: &AuditRecord) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.pattern.window)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut recent = acquire(&self.recent);
        while recent.front().is_some_and(|r| r.timestamp < cutoff) {
            recent.pop_front();
        }
        recent.push_back(record.clone());
    }

    fn write_line(&self, record: &AuditRecord) {
        if let Ok(line) = serde_json::to_string(record) {
            let mut writer = acquire(&self.writer);
            let _ = writeln!(writer, "{line}");
            let _ = writer.flush();
        }
    }
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("queue_capacity", &self.queue_capacity)
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

/// Pattern detection over an event window, oldest first.
fn detect_patterns<'a>(
    window: impl Iterator<Item = &'a AuditRecord>,
    threshold: usize,
) -> Vec<PatternAlert> {
    let mut failures: HashMap<IpAddr, (usize, std::collections::HashSet<&'a str>)> =
        HashMap::new();
    let mut invalid_tokens: HashMap<IpAddr, usize> = HashMap::new();
    let mut previous_event: HashMap<IpAddr, AuditEvent> = HashMap::new();
    let mut alerts = Vec::new();

    for record in window {
        let Some(ip) = record.client_ip else {
            continue;
        };
        match record.event {
            AuditEvent::AuthFailure => {
                let entry = failures.entry(ip).or_default();
                entry.0 += 1;
                if let Some(subject) = &record.subject_id {
                    entry.1.insert(subject.as_str());
                }
            },
            AuditEvent::TokenInvalid => {
                *invalid_tokens.entry(ip).or_default() += 1;
            },
            AuditEvent::AuthSuccess => {
                if previous_event.get(&ip) == Some(&AuditEvent::AuthLockout) {
                    alerts.push(PatternAlert::SuccessAfterLockout { client_ip: ip });
                }
            },
            _ => {},
        }
        previous_event.insert(ip, record.event);
    }

    for (ip, (count, subjects)) in failures {
        if count >= threshold && subjects.len() >= 2 {
            alerts.push(PatternAlert::RepeatedAuthFailures {
                client_ip: ip,
                count,
                accounts: subjects.len(),
            });
        }
    }
    for (ip, count) in invalid_tokens {
        if count >= threshold {
            alerts.push(PatternAlert::RepeatedInvalidTokens {
                client_ip: ip,
                count,
            });
        }
    }
    alerts
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_event_names_are_the_fixed_set() {
        let names: Vec<&str> = [
            AuditEvent::AuthSuccess,
            AuditEvent::AuthFailure,
            AuditEvent::AuthLockout,
            AuditEvent::TokenIssued,
            AuditEvent::TokenVerified,
            AuditEvent::TokenExpired,
            AuditEvent::TokenInvalid,
            AuditEvent::TokenRevoked,
            AuditEvent::AccessGranted,
            AuditEvent::AccessDenied,
            AuditEvent::GuestQrGenerated,
            AuditEvent::GuestTokenIssued,
            AuditEvent::GuestAccess,
            AuditEvent::SuspiciousRateLimit,
            AuditEvent::SuspiciousInvalidAlgorithm,
        ]
        .iter()
        .map(AuditEvent::as_str)
        .collect();
        assert_eq!(names.len(), 15);
        assert!(names.contains(&"auth.lockout"));
        assert!(names.contains(&"suspicious.invalid_algorithm"));
    }

    #[test]
    fn test_sync_events_flush_immediately() {
        let file = NamedTempFile::new().unwrap();
        let logger =
            AuditLogger::new(&AuditSink::File(file.path().to_path_buf()), 16).unwrap();
        logger.emit(
            AuditRecord::new(AuditEvent::AuthFailure, "admin_login")
                .with_ip(ip(1))
                .with_subject("admin"),
        );
        // No flush() call: the synchronous path already wrote the line.
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.contains("auth.failure"));
        assert!(contents.contains("10.0.0.1"));
    }

    #[test]
    fn test_async_events_wait_for_flush() {
        let file = NamedTempFile::new().unwrap();
        let logger =
            AuditLogger::new(&AuditSink::File(file.path().to_path_buf()), 16).unwrap();
        logger.emit(AuditRecord::new(AuditEvent::AccessGranted, "get_entity"));
        assert!(std::fs::read_to_string(file.path()).unwrap().is_empty());
        logger.flush();
        assert!(std::fs::read_to_string(file.path())
            .unwrap()
            .contains("access.granted"));
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let file = NamedTempFile::new().unwrap();
        let logger =
            AuditLogger::new(&AuditSink::File(file.path().to_path_buf()), 2).unwrap();
        for i in 0..5 {
            logger.emit(
                AuditRecord::new(AuditEvent::AccessGranted, format!("op-{i}")),
            );
        }
        assert_eq!(logger.dropped_count(), 3);
        logger.flush();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.contains("op-3"));
        assert!(contents.contains("op-4"));
        assert!(!contents.contains("op-0"));
    }

    #[test]
    fn test_detect_repeated_auth_failures_needs_multiple_accounts() {
        let make = |subject: &str| {
            AuditRecord::new(AuditEvent::AuthFailure, "login")
                .with_ip(ip(9))
                .with_subject(subject)
        };
        // Five failures, one account: no alert.
        let single: Vec<AuditRecord> = (0..5).map(|_| make("admin")).collect();
        assert!(detect_patterns(single.iter(), 5).is_empty());

        // Five failures across two accounts: alert.
        let mut multi: Vec<AuditRecord> = (0..4).map(|_| make("admin")).collect();
        multi.push(make("other"));
        let alerts = detect_patterns(multi.iter(), 5);
        assert!(matches!(
            alerts.as_slice(),
            [PatternAlert::RepeatedAuthFailures { count: 5, accounts: 2, .. }]
        ));
    }

    #[test]
    fn test_detect_repeated_invalid_tokens() {
        let records: Vec<AuditRecord> = (0..5)
            .map(|_| AuditRecord::new(AuditEvent::TokenInvalid, "verify").with_ip(ip(3)))
            .collect();
        let alerts = detect_patterns(records.iter(), 5);
        assert!(matches!(
            alerts.as_slice(),
            [PatternAlert::RepeatedInvalidTokens { count: 5, .. }]
        ));
    }

    #[test]
    fn test_detect_success_after_lockout() {
        let records = vec![
            AuditRecord::new(AuditEvent::AuthLockout, "login").with_ip(ip(7)),
            AuditRecord::new(AuditEvent::AuthSuccess, "login").with_ip(ip(7)),
        ];
        let alerts = detect_patterns(records.iter(), 5);
        assert_eq!(
            alerts,
            vec![PatternAlert::SuccessAfterLockout { client_ip: ip(7) }]
        );

        // An unrelated event in between clears the adjacency.
        let records = vec![
            AuditRecord::new(AuditEvent::AuthLockout, "login").with_ip(ip(7)),
            AuditRecord::new(AuditEvent::AuthFailure, "login").with_ip(ip(7)),
            AuditRecord::new(AuditEvent::AuthSuccess, "login").with_ip(ip(7)),
        ];
        assert!(detect_patterns(records.iter(), 5)
            .iter()
            .all(|a| !matches!(a, PatternAlert::SuccessAfterLockout { .. })));
    }

    #[test]
    fn test_record_json_shape() {
        let record = AuditRecord::new(AuditEvent::TokenExpired, "verify_token")
            .with_ip(ip(1))
            .with_subject("guest-1")
            .with_detail("token_age_secs", 90_i64);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"event\":\"token.expired\""));
        assert!(json.contains("\"severity\":\"warning\""));
        assert!(json.contains("\"token_age_secs\":90"));
    }
}
