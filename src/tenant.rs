use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + sweeper.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to open the same tenant; only the first one
        // into the map gets its WAL and background tasks.
        let engine = match self.engines.entry(tenant.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.config.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(sweeper::run_sweeper(
            engine.clone(),
            engine.config().sweep_interval,
            self.shutdown.child_token(),
        ));
        tokio::spawn(sweeper::run_compactor(
            engine.clone(),
            engine.config().compact_threshold,
            self.shutdown.child_token(),
        ));

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("tenant {tenant} loaded");
        Ok(engine)
    }

    /// Stop every tenant's sweeper and compactor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
