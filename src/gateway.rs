//! Gateway facade.
//!
//! Wires the transport registry, capability catalog, discoverer, refresh
//! scheduler, config state, and virtual-server manager together, and
//! exposes the operations a management plane drives: upstream CRUD and
//! inspection, tool-execution passthrough, and virtual-server lifecycle.

use crate::catalog::CapabilityCatalog;
use crate::config::{Config, UpstreamSpec};
use crate::discovery::{Discoverer, RefreshScheduler};
use crate::error::{Error, Result};
use crate::state::{ConfigState, UpstreamDefinition};
use crate::transport::{SseTransport, Transport, TransportConfig, TransportRegistry};
use crate::types::{McpRequest, Prompt, RequestId, Resource, Tool};
use crate::vmcp::{HealthReport, NewVmcp, VmcpDefinition, VmcpManager};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The assembled gateway core.
pub struct Gateway {
    state: Arc<ConfigState>,
    registry: Arc<TransportRegistry>,
    catalog: Arc<CapabilityCatalog>,
    discoverer: Arc<Discoverer>,
    scheduler: RefreshScheduler,
    vmcps: Arc<VmcpManager>,
    status_task: JoinHandle<()>,
}

impl Gateway {
    /// Build the gateway from a validated configuration. Upstream
    /// definitions and transports are registered; nothing connects until
    /// [`Gateway::bootstrap`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(ConfigState::new(config.clone()));
        let registry = Arc::new(TransportRegistry::new());
        let catalog = Arc::new(CapabilityCatalog::new());
        let discoverer = Arc::new(Discoverer::new(registry.clone(), catalog.clone()));

        let scheduler_state = state.clone();
        let scheduler = RefreshScheduler::new(discoverer.clone(), config.refresh.interval())
            .with_error_handler(Arc::new(move |upstream, error| {
                scheduler_state.record_error(upstream, error.to_string());
            }));

        let vmcps = Arc::new(VmcpManager::new(
            state.clone(),
            registry.clone(),
            catalog.clone(),
            config.server.host.clone(),
            config.server.port,
            config.vmcp.clone(),
        ));

        // bridge transport status events into the config state
        let bridge_state = state.clone();
        let mut events = registry.subscribe();
        let status_task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => bridge_state.apply_status_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status event bridge lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let gateway = Self {
            state,
            registry,
            catalog,
            discoverer,
            scheduler,
            vmcps,
            status_task,
        };

        for spec in &config.mcp_servers {
            gateway
                .state
                .insert_upstream(UpstreamDefinition::from_spec(spec))?;
            gateway.register_upstream(spec)?;
        }

        Ok(gateway)
    }

    /// Connect the enabled upstreams, run initial discovery, start the
    /// refresh schedule, and bring up the configured virtual servers.
    pub async fn bootstrap(&self) -> Result<()> {
        let config = self.state.config();

        for upstream in self.state.list() {
            if upstream.disabled {
                info!(upstream = %upstream.name, "skipping disabled upstream");
                continue;
            }
            match self.registry.connect(&upstream.name).await {
                // discovery must land before the configured vmcps aggregate
                Ok(()) => {
                    if let Err(e) = self.refresh_capabilities(&upstream.name).await {
                        warn!(upstream = %upstream.name, "initial discovery failed: {}", e);
                    }
                },
                Err(e) => {
                    warn!(upstream = %upstream.name, "initial connect failed: {}", e);
                },
            }
            self.scheduler.watch(&upstream.name);
        }

        for spec in &config.vmcps {
            let new = NewVmcp {
                name: spec.name.clone(),
                port: spec.port,
                source_server_ids: spec.source_server_ids.clone(),
                aggregation_rules: spec.aggregation_rules.clone(),
            };
            if let Err(e) = self.vmcps.add(new).await {
                warn!(vmcp = %spec.name, "failed to add configured vmcp: {}", e);
            }
        }

        info!(
            upstreams = self.state.list().len(),
            vmcps = self.vmcps.list().len(),
            "gateway bootstrapped"
        );
        Ok(())
    }

    /// Stop everything: virtual servers, refresh schedule, transports.
    pub async fn shutdown(&self) {
        self.vmcps.stop_all().await;
        self.scheduler.stop();
        for name in self.registry.list() {
            if let Err(e) = self.registry.disconnect(&name).await {
                warn!(upstream = %name, "disconnect failed: {}", e);
            }
        }
        self.status_task.abort();
        info!("gateway shut down");
    }

    // ---- upstream management -------------------------------------------

    /// Define a new upstream and, unless disabled, connect and discover it.
    pub async fn add_upstream(&self, spec: UpstreamSpec) -> Result<UpstreamDefinition> {
        self.state
            .insert_upstream(UpstreamDefinition::from_spec(&spec))?;
        if let Err(e) = self.register_upstream(&spec) {
            let _ = self.state.remove_upstream(&spec.name);
            return Err(e);
        }

        if !spec.disabled {
            if let Err(e) = self.registry.connect(&spec.name).await {
                warn!(upstream = %spec.name, "connect failed: {}", e);
            } else if let Err(e) = self.refresh_capabilities(&spec.name).await {
                warn!(upstream = %spec.name, "initial discovery failed: {}", e);
            }
            self.scheduler.watch(&spec.name);
        }

        self.state
            .get(&spec.name)
            .ok_or_else(|| Error::ServerNotFound(spec.name.clone()))
    }

    /// Remove an upstream definition, its transport, and its catalog
    /// entries. Virtual servers that referenced it degrade on their own.
    pub async fn remove_upstream(&self, name: &str) -> Result<UpstreamDefinition> {
        self.scheduler.unwatch(name);
        match self.registry.remove(name).await {
            // a terminally closed transport already removed itself
            Ok(()) | Err(Error::ServerNotFound(_)) => {},
            Err(e) => return Err(e),
        }
        self.catalog.remove_source(name);
        self.state.remove_upstream(name)
    }

    /// Enable or disable an upstream connection.
    pub async fn set_upstream_disabled(&self, name: &str, disabled: bool) -> Result<()> {
        self.state.set_disabled(name, disabled)?;

        if disabled {
            self.scheduler.unwatch(name);
            match self.registry.disconnect(name).await {
                Ok(()) | Err(Error::ServerNotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            self.ensure_transport(name)?;
            self.registry.connect(name).await?;
            if let Err(e) = self.refresh_capabilities(name).await {
                warn!(upstream = %name, "discovery after enable failed: {}", e);
            }
            self.scheduler.watch(name);
            Ok(())
        }
    }

    pub fn upstream(&self, name: &str) -> Option<UpstreamDefinition> {
        self.state.get(name)
    }

    pub fn upstreams(&self) -> Vec<UpstreamDefinition> {
        self.state.list()
    }

    // ---- capability inspection -----------------------------------------

    pub fn upstream_capabilities(
        &self,
        name: &str,
    ) -> Result<(Vec<Tool>, Vec<Prompt>, Vec<Resource>)> {
        if !self.state.contains(name) {
            return Err(Error::ServerNotFound(name.to_string()));
        }
        Ok((
            self.catalog.tools_for_source(name),
            self.catalog.prompts_for_source(name),
            self.catalog.resources_for_source(name),
        ))
    }

    /// Re-run discovery for one upstream right now.
    pub async fn refresh_capabilities(&self, name: &str) -> Result<()> {
        self.ensure_transport(name)?;
        self.discoverer.discover(name).await?;
        self.state.mark_discovered(name);
        Ok(())
    }

    /// Probe an upstream with `health/check`.
    pub async fn test_upstream(&self, name: &str) -> Result<bool> {
        if !self.state.contains(name) {
            return Err(Error::ServerNotFound(name.to_string()));
        }
        let request = McpRequest::new("health/check", json!({}), RequestId::generate());
        Ok(self.registry.request(name, request).await.is_ok())
    }

    /// Tool-execution passthrough to one upstream.
    pub async fn execute_tool(
        &self,
        upstream: &str,
        tool_name: &str,
        params: Value,
    ) -> Result<Value> {
        let request = McpRequest::new(
            "tools/call",
            json!({"name": tool_name, "arguments": params}),
            RequestId::generate(),
        );
        let response = self.registry.request(upstream, request).await?;
        Ok(response.result.unwrap_or(Value::Null))
    }

    // ---- virtual servers -----------------------------------------------

    pub async fn create_vmcp(&self, new: NewVmcp) -> Result<VmcpDefinition> {
        self.vmcps.add(new).await
    }

    pub async fn remove_vmcp(&self, id: &str) -> Result<()> {
        self.vmcps.remove(id).await
    }

    pub async fn start_vmcp(&self, id: &str) -> Result<()> {
        self.vmcps.start(id).await
    }

    pub async fn stop_vmcp(&self, id: &str) -> Result<()> {
        self.vmcps.stop(id).await
    }

    pub fn vmcp(&self, id: &str) -> Option<VmcpDefinition> {
        self.vmcps.get(id)
    }

    pub fn vmcps(&self) -> Vec<VmcpDefinition> {
        self.vmcps.list()
    }

    pub async fn vmcp_health(&self, id: &str) -> Result<HealthReport> {
        let instance = self
            .vmcps
            .get_instance(id)
            .ok_or_else(|| Error::InstanceNotRunning(id.to_string()))?;
        Ok(instance.check_health().await)
    }

    pub fn vmcp_capabilities(
        &self,
        id: &str,
    ) -> Result<(Vec<Tool>, Vec<Prompt>, Vec<Resource>)> {
        let instance = self
            .vmcps
            .get_instance(id)
            .ok_or_else(|| Error::InstanceNotRunning(id.to_string()))?;
        instance.capabilities()
    }

    pub fn vmcp_dependents(&self, id: &str) -> Result<Vec<String>> {
        self.vmcps.dependents(id)
    }

    // ---- internals ------------------------------------------------------

    fn register_upstream(&self, spec: &UpstreamSpec) -> Result<()> {
        let transport = self.build_transport(spec)?;
        self.registry.add(&spec.name, transport)
    }

    /// Re-register a transport that terminal closure auto-removed.
    fn ensure_transport(&self, name: &str) -> Result<()> {
        if self.registry.get(name).is_some() {
            return Ok(());
        }
        let definition = self
            .state
            .get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        let spec = UpstreamSpec {
            name: definition.name,
            url: definition.url,
            auth_token: definition.auth_token,
            disabled: definition.disabled,
        };
        self.register_upstream(&spec)
    }

    fn build_transport(&self, spec: &UpstreamSpec) -> Result<Arc<dyn Transport>> {
        let settings = &self.state.config().transport;
        let config = TransportConfig {
            base_url: spec.url.clone(),
            auth_token: spec.auth_token.clone(),
            timeout: settings.timeout(),
            retry_delay: settings.retry_delay(),
            max_retries: settings.max_retries,
            queue_high_water: settings.queue_high_water,
        };
        let transport = SseTransport::new(config).map_err(Error::Transport)?;
        Ok(Arc::new(transport))
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.status_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmcp::AggregationRule;

    fn spec(name: &str, port: u16) -> UpstreamSpec {
        UpstreamSpec {
            name: name.to_string(),
            url: format!("http://127.0.0.1:{}", port),
            auth_token: None,
            disabled: true, // nothing connects in these tests
        }
    }

    #[tokio::test]
    async fn test_new_registers_configured_upstreams() {
        let mut config = Config::default();
        config.mcp_servers.push(spec("u1", 40001));

        let gateway = Gateway::new(config).unwrap();
        assert!(gateway.upstream("u1").is_some());
        assert!(gateway.registry.get("u1").is_some());
    }

    #[tokio::test]
    async fn test_add_and_remove_upstream() {
        let gateway = Gateway::new(Config::default()).unwrap();

        let definition = gateway.add_upstream(spec("u1", 40001)).await.unwrap();
        assert_eq!(definition.name, "u1");
        assert!(gateway.upstreams().len() == 1);

        // duplicate name rejected, state left consistent
        assert!(gateway.add_upstream(spec("u1", 40002)).await.is_err());
        assert_eq!(gateway.upstreams().len(), 1);

        gateway.remove_upstream("u1").await.unwrap();
        assert!(gateway.upstream("u1").is_none());
        assert!(gateway.registry.get("u1").is_none());
    }

    #[tokio::test]
    async fn test_capabilities_require_known_upstream() {
        let gateway = Gateway::new(Config::default()).unwrap();
        assert!(matches!(
            gateway.upstream_capabilities("nope"),
            Err(Error::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_vmcp_validates_sources() {
        let gateway = Gateway::new(Config::default()).unwrap();
        let result = gateway
            .create_vmcp(NewVmcp {
                name: "v1".to_string(),
                port: 5001,
                source_server_ids: vec!["missing".to_string()],
                aggregation_rules: vec![AggregationRule::AggregateAll],
            })
            .await;
        assert!(matches!(result, Err(Error::UnknownSource(_))));
    }

    #[tokio::test]
    async fn test_vmcp_health_requires_running_instance() {
        let gateway = Gateway::new(Config::default()).unwrap();
        assert!(matches!(
            gateway.vmcp_health("nope").await,
            Err(Error::InstanceNotRunning(_))
        ));
    }
}
