//! Capability discovery.
//!
//! Runs the three list queries against a named upstream, normalizes the
//! records with source attribution, and replaces that source's catalog
//! entries. A refresh scheduler re-runs discovery per upstream on a fixed
//! interval, immune to individual failures.

use crate::catalog::CapabilityCatalog;
use crate::error::{Error, Result};
use crate::transport::TransportRegistry;
use crate::types::{McpRequest, Prompt, RequestId, Resource, Tool};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Counts of capabilities registered by one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
}

/// Discovers and registers upstream capabilities.
pub struct Discoverer {
    registry: Arc<TransportRegistry>,
    catalog: Arc<CapabilityCatalog>,
}

impl Discoverer {
    pub fn new(registry: Arc<TransportRegistry>, catalog: Arc<CapabilityCatalog>) -> Self {
        Self { registry, catalog }
    }

    /// Discover tools, prompts, and resources for one upstream.
    ///
    /// Partial failure is explicit: each kind is fetched and registered
    /// independently, entries from successful kinds stay registered, and the
    /// first failing kind decides the returned error.
    pub async fn discover(&self, upstream: &str) -> Result<DiscoverySummary> {
        if !self.registry.is_connected(upstream) {
            self.registry.connect(upstream).await?;
        }

        let mut summary = DiscoverySummary::default();
        let mut first_error: Option<Error> = None;

        match self.fetch_tools(upstream).await {
            Ok(tools) => {
                summary.tools = tools.len();
                self.catalog.replace_tools(upstream, tools)?;
            },
            Err(detail) => {
                warn!(upstream, "tool discovery failed: {}", detail);
                first_error.get_or_insert(Error::ToolsDiscoveryFailed {
                    upstream: upstream.to_string(),
                    detail,
                });
            },
        }

        match self.fetch_prompts(upstream).await {
            Ok(prompts) => {
                summary.prompts = prompts.len();
                self.catalog.replace_prompts(upstream, prompts)?;
            },
            Err(detail) => {
                warn!(upstream, "prompt discovery failed: {}", detail);
                first_error.get_or_insert(Error::PromptsDiscoveryFailed {
                    upstream: upstream.to_string(),
                    detail,
                });
            },
        }

        match self.fetch_resources(upstream).await {
            Ok(resources) => {
                summary.resources = resources.len();
                self.catalog.replace_resources(upstream, resources)?;
            },
            Err(detail) => {
                warn!(upstream, "resource discovery failed: {}", detail);
                first_error.get_or_insert(Error::ResourcesDiscoveryFailed {
                    upstream: upstream.to_string(),
                    detail,
                });
            },
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                info!(
                    upstream,
                    tools = summary.tools,
                    prompts = summary.prompts,
                    resources = summary.resources,
                    "discovery complete"
                );
                Ok(summary)
            },
        }
    }

    async fn fetch_tools(&self, upstream: &str) -> std::result::Result<Vec<Tool>, String> {
        let entries = self.fetch_array(upstream, "tools/list", "tools").await?;
        let mut tools = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut tool: Tool =
                serde_json::from_value(entry).map_err(|e| format!("malformed tool: {}", e))?;
            tool.source = upstream.to_string();
            tools.push(tool);
        }
        Ok(tools)
    }

    async fn fetch_prompts(&self, upstream: &str) -> std::result::Result<Vec<Prompt>, String> {
        let entries = self.fetch_array(upstream, "prompts/list", "prompts").await?;
        let mut prompts = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut prompt: Prompt =
                serde_json::from_value(entry).map_err(|e| format!("malformed prompt: {}", e))?;
            prompt.source = upstream.to_string();
            prompts.push(prompt);
        }
        Ok(prompts)
    }

    async fn fetch_resources(&self, upstream: &str) -> std::result::Result<Vec<Resource>, String> {
        let entries = self
            .fetch_array(upstream, "resources/list", "resources")
            .await?;
        let mut resources = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut resource: Resource =
                serde_json::from_value(entry).map_err(|e| format!("malformed resource: {}", e))?;
            resource.source = upstream.to_string();
            resources.push(resource);
        }
        Ok(resources)
    }

    /// Issue one list request and unwrap the single array property the
    /// response is expected to carry.
    async fn fetch_array(
        &self,
        upstream: &str,
        method: &str,
        key: &str,
    ) -> std::result::Result<Vec<Value>, String> {
        let request = McpRequest::new(method, json!({}), RequestId::generate());
        let response = self
            .registry
            .request(upstream, request)
            .await
            .map_err(|e| e.to_string())?;

        let result = response
            .result
            .ok_or_else(|| format!("no result in {} response", method))?;
        result
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| format!("no '{}' array in {} response", key, method))
    }
}

/// Error hook invoked when a scheduled refresh fails.
pub type RefreshErrorHandler = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// Periodically re-runs discovery for each watched upstream.
pub struct RefreshScheduler {
    discoverer: Arc<Discoverer>,
    refresh_interval: Duration,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    on_error: Option<RefreshErrorHandler>,
}

impl RefreshScheduler {
    pub fn new(discoverer: Arc<Discoverer>, refresh_interval: Duration) -> Self {
        Self {
            discoverer,
            refresh_interval,
            tasks: Mutex::new(HashMap::new()),
            on_error: None,
        }
    }

    pub fn with_error_handler(mut self, handler: RefreshErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Start watching an upstream: discover immediately, then every
    /// interval. Failures invoke the error hook and never stall the
    /// schedule.
    pub fn watch(&self, upstream: &str) {
        let discoverer = self.discoverer.clone();
        let on_error = self.on_error.clone();
        let name = upstream.to_string();
        let period = self.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                // first tick fires immediately
                ticker.tick().await;
                if let Err(e) = discoverer.discover(&name).await {
                    warn!(upstream = %name, "scheduled refresh failed: {}", e);
                    if let Some(handler) = &on_error {
                        handler(&name, &e);
                    }
                }
            }
        });

        if let Some(previous) = self.tasks.lock().insert(upstream.to_string(), handle) {
            previous.abort();
        }
        debug!(upstream, "refresh watch started");
    }

    /// Stop watching one upstream.
    pub fn unwatch(&self, upstream: &str) {
        if let Some(handle) = self.tasks.lock().remove(upstream) {
            handle.abort();
        }
    }

    /// Stop all watches.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
