//! The `serve` command: run the server core until interrupted.

use crate::config::HomeGraphConfig;
use crate::mcp::ToolRegistry;
use crate::security::{
    AccessControl, AuditLogger, AuditSink, AuthService, RateLimiter,
};
use crate::services::GraphService;
use crate::storage::SqliteGraphStore;
use crate::sync::SyncService;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Queue capacity for the audit logger, sized to absorb a one-second burst
/// at expected peak.
const AUDIT_QUEUE_CAPACITY: usize = 4096;

/// Everything the transport layer mounts routes over.
pub struct ServerCore {
    /// Graph reads and writes.
    pub graph: Arc<GraphService>,
    /// Tool dispatch.
    pub tools: ToolRegistry,
    /// Sync phase handlers.
    pub sync: Arc<SyncService>,
    /// Login, enrollment, verification, enforcement.
    pub auth: Arc<AuthService>,
    /// Audit stream.
    pub audit: Arc<AuditLogger>,
    /// Per-IP limiter.
    pub rate_limiter: Arc<RateLimiter>,
}

impl ServerCore {
    /// Builds the full service graph from configuration.
    pub fn build(config: &HomeGraphConfig) -> Result<Self> {
        config.validate_for_serve()?;

        let store = Arc::new(SqliteGraphStore::new(&config.database_url)?);
        let graph = Arc::new(GraphService::new(store)?);

        let sink = config
            .audit_sink_path
            .as_ref()
            .map_or(AuditSink::Stderr, |p| AuditSink::File(p.clone()));
        let audit = Arc::new(AuditLogger::new(&sink, AUDIT_QUEUE_CAPACITY)?);
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        let signing_key = config
            .signing_key
            .clone()
            .ok_or_else(|| Error::InvalidArgument("signing key missing".to_string()))?;
        let admin_hash = config
            .admin_password_hash
            .clone()
            .ok_or_else(|| Error::InvalidArgument("admin password hash missing".to_string()))?;

        let mut policy = AccessControl::new();
        if let Some(types) = &config.guest_readable_types {
            policy = policy.with_guest_readable_types(types.iter().copied());
        }

        let auth = Arc::new(AuthService::new(
            admin_hash,
            &signing_key,
            Arc::clone(&rate_limiter),
            Arc::clone(&audit),
            policy,
            config.server_device_id.clone(),
            config.admin_token_ttl,
        )?);

        let sync = Arc::new(SyncService::new(
            Arc::clone(&graph),
            config.server_device_id.clone(),
            config.sync_batch_max,
        ));

        Ok(Self {
            tools: ToolRegistry::new(Arc::clone(&graph)),
            graph,
            sync,
            auth,
            audit,
            rate_limiter,
        })
    }
}

/// Runs the server until Ctrl-C.
pub struct ServeCommand;

impl ServeCommand {
    /// Builds the core, starts the background tasks, and parks until the
    /// shutdown signal.
    pub async fn execute(config: &HomeGraphConfig) -> Result<()> {
        let core = ServerCore::build(config)?;

        let audit_writer = core.audit.spawn_writer();
        let pattern_detector = core.audit.spawn_detector(Duration::from_secs(30));
        let bucket_sweeper = core.rate_limiter.spawn_sweeper();

        let stats = core.graph.stats()?;
        tracing::info!(
            bind = %config.bind_address,
            port = config.port,
            entities = stats.entity_count,
            versions = stats.version_count,
            relationships = stats.relationship_count,
            "homegraph core ready"
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown_tx = std::sync::Mutex::new(Some(shutdown_tx));
        ctrlc::set_handler(move || {
            if let Ok(mut guard) = shutdown_tx.lock() {
                if let Some(tx) = guard.take() {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| Error::OperationFailed {
            operation: "install_signal_handler".to_string(),
            cause: e.to_string(),
        })?;

        let _ = shutdown_rx.await;
        tracing::info!("shutdown signal received, draining");

        audit_writer.abort();
        pattern_detector.abort();
        bucket_sweeper.abort();
        core.audit.flush();
        Ok(())
    }
}
