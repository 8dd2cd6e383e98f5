//! Virtual-server lifecycle management.
//!
//! Process-wide store of vMCP definitions keyed by id. Validates new
//! definitions (port uniqueness against the management port and every other
//! definition, source cross-references), serializes start/stop per id, and
//! owns the running instances.

use crate::catalog::CapabilityCatalog;
use crate::config::VmcpLimits;
use crate::error::{Error, Result};
use crate::state::ConfigState;
use crate::transport::TransportRegistry;
use crate::types::VmcpStatus;
use crate::vmcp::instance::InstanceConfig;
use crate::vmcp::{AggregationRule, StatusCell, VmcpDefinition, VmcpInstance};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Input for creating a virtual server.
#[derive(Debug, Clone)]
pub struct NewVmcp {
    pub name: String,
    pub port: u16,
    pub source_server_ids: Vec<String>,
    pub aggregation_rules: Vec<AggregationRule>,
}

struct StoredVmcp {
    name: String,
    port: u16,
    source_server_ids: Vec<String>,
    aggregation_rules: Vec<AggregationRule>,
    created_at: DateTime<Utc>,
    status: Arc<StatusCell>,
}

/// Store and lifecycle driver for virtual servers.
pub struct VmcpManager {
    state: Arc<ConfigState>,
    registry: Arc<TransportRegistry>,
    catalog: Arc<CapabilityCatalog>,
    bind_host: String,
    management_port: u16,
    limits: VmcpLimits,
    definitions: DashMap<String, StoredVmcp>,
    instances: DashMap<String, Arc<VmcpInstance>>,
    /// Per-id lock serializing start/stop/remove.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl VmcpManager {
    pub fn new(
        state: Arc<ConfigState>,
        registry: Arc<TransportRegistry>,
        catalog: Arc<CapabilityCatalog>,
        bind_host: String,
        management_port: u16,
        limits: VmcpLimits,
    ) -> Self {
        Self {
            state,
            registry,
            catalog,
            bind_host,
            management_port,
            limits,
            definitions: DashMap::new(),
            instances: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Add a definition and attempt to start it.
    ///
    /// A failed auto-start leaves the definition in place with status
    /// `error`; validation failures reject the definition outright.
    pub async fn add(&self, new: NewVmcp) -> Result<VmcpDefinition> {
        self.validate(&new)?;

        let id = uuid::Uuid::new_v4().to_string();
        let stored = StoredVmcp {
            name: new.name.clone(),
            port: new.port,
            source_server_ids: new.source_server_ids.clone(),
            aggregation_rules: new.aggregation_rules.clone(),
            created_at: Utc::now(),
            status: Arc::new(StatusCell::new()),
        };
        self.definitions.insert(id.clone(), stored);
        info!(vmcp = %new.name, %id, port = new.port, "virtual server defined");

        if let Err(e) = self.start(&id).await {
            warn!(vmcp = %new.name, "auto-start failed: {}", e);
        }

        self.get(&id).ok_or_else(|| Error::ServerNotFound(id))
    }

    /// Start a stopped virtual server.
    pub async fn start(&self, id: &str) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let config = {
            let stored = self
                .definitions
                .get(id)
                .ok_or_else(|| Error::ServerNotFound(id.to_string()))?;
            InstanceConfig {
                id: id.to_string(),
                name: stored.name.clone(),
                host: self.bind_host.clone(),
                port: stored.port,
                source_server_ids: stored.source_server_ids.clone(),
                aggregation_rules: stored.aggregation_rules.clone(),
            }
        };
        let status = self.status_cell(id)?;

        let instance = Arc::new(VmcpInstance::new(
            config,
            self.registry.clone(),
            self.catalog.clone(),
            status,
        ));
        instance.start().await?;
        self.instances.insert(id.to_string(), instance);
        Ok(())
    }

    /// Stop a running virtual server. A second stop is a no-op.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        if !self.definitions.contains_key(id) {
            return Err(Error::ServerNotFound(id.to_string()));
        }
        if let Some((_, instance)) = self.instances.remove(id) {
            instance.stop().await;
        } else {
            // not running; still settle the recorded status
            if let Ok(status) = self.status_cell(id) {
                if status.status() != VmcpStatus::Stopped {
                    status.set_status(VmcpStatus::Stopped);
                }
            }
        }
        Ok(())
    }

    /// Stop (best-effort) and delete a definition.
    pub async fn remove(&self, id: &str) -> Result<()> {
        if let Err(e) = self.stop(id).await {
            warn!(%id, "stop before removal failed: {}", e);
        }

        let lock = self.id_lock(id);
        let _guard = lock.lock().await;
        self.definitions
            .remove(id)
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))?;
        self.locks.remove(id);
        info!(%id, "virtual server removed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<VmcpDefinition> {
        self.definitions.get(id).map(|stored| compose(id, &stored))
    }

    pub fn list(&self) -> Vec<VmcpDefinition> {
        let mut definitions: Vec<VmcpDefinition> = self
            .definitions
            .iter()
            .map(|entry| compose(entry.key(), entry.value()))
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn get_instance(&self, id: &str) -> Option<Arc<VmcpInstance>> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    /// Source upstream ids a virtual server depends on.
    pub fn dependents(&self, id: &str) -> Result<Vec<String>> {
        self.definitions
            .get(id)
            .map(|stored| stored.source_server_ids.clone())
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))
    }

    pub async fn start_all(&self) {
        for id in self.ids() {
            if let Err(e) = self.start(&id).await {
                warn!(%id, "start failed: {}", e);
            }
        }
    }

    pub async fn stop_all(&self) {
        for id in self.ids() {
            if let Err(e) = self.stop(&id).await {
                warn!(%id, "stop failed: {}", e);
            }
        }
    }

    fn ids(&self) -> Vec<String> {
        self.definitions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn id_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn status_cell(&self, id: &str) -> Result<Arc<StatusCell>> {
        self.definitions
            .get(id)
            .map(|stored| stored.status.clone())
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))
    }

    fn validate(&self, new: &NewVmcp) -> Result<()> {
        if new.name.trim().is_empty() {
            return Err(Error::Config("vmcp name must not be empty".into()));
        }
        if new.source_server_ids.is_empty() {
            return Err(Error::Config(
                "vmcp requires at least one source server".into(),
            ));
        }
        if new.aggregation_rules.is_empty() {
            return Err(Error::Config(
                "vmcp requires at least one aggregation rule".into(),
            ));
        }

        if let Some(max) = self.limits.max_instances {
            if self.definitions.len() >= max {
                return Err(Error::Config(format!(
                    "vmcp instance limit ({}) reached",
                    max
                )));
            }
        }

        if new.port == self.management_port {
            return Err(Error::PortUnavailable(new.port));
        }
        if let Some(range) = &self.limits.port_range {
            if !range.contains(new.port) {
                return Err(Error::PortUnavailable(new.port));
            }
        }
        // collisions count against every known definition, running or not
        if self.definitions.iter().any(|entry| entry.port == new.port) {
            return Err(Error::PortUnavailable(new.port));
        }

        for source in &new.source_server_ids {
            if !self.state.contains(source) {
                return Err(Error::UnknownSource(source.clone()));
            }
        }

        Ok(())
    }
}

fn compose(id: &str, stored: &StoredVmcp) -> VmcpDefinition {
    let (status, underlying, updated_at) = stored.status.snapshot();
    VmcpDefinition {
        id: id.to_string(),
        name: stored.name.clone(),
        port: stored.port,
        source_server_ids: stored.source_server_ids.clone(),
        aggregation_rules: stored.aggregation_rules.clone(),
        status,
        underlying_servers_status: underlying,
        created_at: stored.created_at,
        updated_at,
    }
}
