//! Virtual-server runtime.
//!
//! A virtual server (vMCP) re-exposes a filtered, merged view of one or
//! more upstreams on its own port, speaking the same SSE+POST protocol the
//! gateway consumes.

pub mod aggregator;
pub mod instance;
pub mod manager;

pub use aggregator::{aggregate, AggregatedView, AggregationRule, RouteTarget, RoutingMap};
pub use instance::{HealthReport, VmcpInstance};
pub use manager::{NewVmcp, VmcpManager};

use crate::types::{UnderlyingServerStatus, VmcpStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A virtual-server definition with its runtime status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmcpDefinition {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub source_server_ids: Vec<String>,
    pub aggregation_rules: Vec<AggregationRule>,
    pub status: VmcpStatus,
    pub underlying_servers_status: Vec<UnderlyingServerStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shared dynamic status of one virtual server.
///
/// The manager owns the definition, the running instance drives status
/// transitions; both hold this cell, so neither needs a pointer to the
/// other.
#[derive(Debug)]
pub struct StatusCell {
    inner: RwLock<StatusInner>,
}

#[derive(Debug)]
struct StatusInner {
    status: VmcpStatus,
    underlying: Vec<UnderlyingServerStatus>,
    updated_at: DateTime<Utc>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StatusInner {
                status: VmcpStatus::Stopped,
                underlying: Vec::new(),
                updated_at: Utc::now(),
            }),
        }
    }

    pub fn status(&self) -> VmcpStatus {
        self.inner.read().status
    }

    /// Every transition bumps `updated_at`.
    pub fn set_status(&self, status: VmcpStatus) {
        let mut inner = self.inner.write();
        inner.status = status;
        inner.updated_at = Utc::now();
    }

    pub fn set_underlying(&self, underlying: Vec<UnderlyingServerStatus>) {
        let mut inner = self.inner.write();
        inner.underlying = underlying;
        inner.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> (VmcpStatus, Vec<UnderlyingServerStatus>, DateTime<Utc>) {
        let inner = self.inner.read();
        (inner.status, inner.underlying.clone(), inner.updated_at)
    }
}
