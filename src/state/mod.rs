//! Process-wide configuration state.
//!
//! The authoritative in-memory record of upstream definitions and their
//! runtime status. Written by the management surface, by transport status
//! events, and by discovery outcomes; read as point-in-time snapshots.
//! Nothing here is durable.

use crate::config::{Config, UpstreamSpec};
use crate::error::{Error, Result};
use crate::transport::TransportStatusEvent;
use crate::types::UpstreamStatus;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// An upstream MCP server definition with its runtime status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamDefinition {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub disabled: bool,
    pub status: UpstreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UpstreamDefinition {
    pub fn from_spec(spec: &UpstreamSpec) -> Self {
        Self {
            name: spec.name.clone(),
            url: spec.url.clone(),
            auth_token: spec.auth_token.clone(),
            disabled: spec.disabled,
            status: UpstreamStatus::Offline,
            last_seen: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Single-writer, snapshot-reader store of app config and upstreams.
pub struct ConfigState {
    config: ArcSwap<Config>,
    upstreams: RwLock<HashMap<String, UpstreamDefinition>>,
}

impl ConfigState {
    pub fn new(config: Config) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            upstreams: RwLock::new(HashMap::new()),
        }
    }

    /// Current config snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn update_config(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    /// Register an upstream definition.
    ///
    /// Names are unique; so is host:port among enabled upstreams.
    pub fn insert_upstream(&self, definition: UpstreamDefinition) -> Result<()> {
        let endpoint = enabled_endpoint_key(&definition)?;

        let mut upstreams = self.upstreams.write();
        if upstreams.contains_key(&definition.name) {
            return Err(Error::Config(format!(
                "upstream '{}' already defined",
                definition.name
            )));
        }
        if let Some(endpoint) = endpoint {
            for existing in upstreams.values() {
                if !existing.disabled && enabled_endpoint_key(existing)? == Some(endpoint.clone()) {
                    return Err(Error::Config(format!(
                        "upstream url '{}' already in use by '{}'",
                        definition.url, existing.name
                    )));
                }
            }
        }
        upstreams.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn remove_upstream(&self, name: &str) -> Result<UpstreamDefinition> {
        self.upstreams
            .write()
            .remove(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    pub fn set_disabled(&self, name: &str, disabled: bool) -> Result<()> {
        let mut upstreams = self.upstreams.write();
        let upstream = upstreams
            .get_mut(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        upstream.disabled = disabled;
        upstream.updated_at = Utc::now();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<UpstreamDefinition> {
        self.upstreams.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.upstreams.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<UpstreamDefinition> {
        let mut definitions: Vec<UpstreamDefinition> =
            self.upstreams.read().values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Record a transport status transition.
    pub fn apply_status_event(&self, event: &TransportStatusEvent) {
        let mut upstreams = self.upstreams.write();
        if let Some(upstream) = upstreams.get_mut(&event.upstream) {
            upstream.status = event.status;
            upstream.last_error = event.detail.clone();
            if event.status == UpstreamStatus::Online {
                upstream.last_seen = Some(Utc::now());
            }
            upstream.updated_at = Utc::now();
        }
    }

    /// Record a non-fatal operational error against an upstream.
    pub fn record_error(&self, name: &str, detail: impl Into<String>) {
        let mut upstreams = self.upstreams.write();
        if let Some(upstream) = upstreams.get_mut(name) {
            upstream.last_error = Some(detail.into());
            upstream.updated_at = Utc::now();
        }
    }

    /// Record a successful discovery pass.
    pub fn mark_discovered(&self, name: &str) {
        let mut upstreams = self.upstreams.write();
        if let Some(upstream) = upstreams.get_mut(name) {
            upstream.last_seen = Some(Utc::now());
            upstream.updated_at = Utc::now();
        }
    }
}

fn enabled_endpoint_key(definition: &UpstreamDefinition) -> Result<Option<String>> {
    if definition.disabled {
        return Ok(None);
    }
    let parsed = url::Url::parse(&definition.url)
        .map_err(|e| Error::Config(format!("invalid url '{}': {}", definition.url, e)))?;
    Ok(Some(format!(
        "{}:{}",
        parsed.host_str().unwrap_or_default(),
        parsed.port_or_known_default().unwrap_or_default()
    )))
}
