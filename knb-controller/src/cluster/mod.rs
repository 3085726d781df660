//! The control-plane operations the controllers depend on.

mod kubectl;

pub use kubectl::{parse_forwarded_port, Kubectl};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Child;

use crate::exec::ExecError;

pub const POD_NAME: &str = ".metadata.name";
pub const POD_NODE: &str = ".spec.nodeName";
pub const POD_IP: &str = ".status.podIP";
pub const POD_PHASE: &str = ".status.phase";
pub const SERVICE_IP: &str = ".spec.clusterIP";
pub const NODE_NAME: &str = ".metadata.name";

/// What the control plane prints for a field that has no value yet.
pub const NOT_READY: &str = "<none>";

/// Everything a run may have created.
pub const RUN_RESOURCE_KINDS: &[&str] = &["pod", "deployment", "service", "networkpolicy"];

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("selector {selector} did not match a single resource: {rows:?}")]
    NotSingle { selector: String, rows: Vec<String> },
    #[error("timed out after {wait:?} waiting for port-forward to {target}:{port}")]
    TunnelTimeout { target: String, port: u16, wait: Duration },
    #[error("port-forward to {target}:{port} failed: {reason}")]
    Tunnel { target: String, port: u16, reason: String },
}

/// Pod lookup: label selector, optional node restriction, columns wanted.
#[derive(Debug, Clone, Copy)]
pub struct PodQuery<'a> {
    pub selector: &'a str,
    pub node: Option<&'a str>,
    pub fields: &'a [&'a str],
}

impl<'a> PodQuery<'a> {
    pub fn new(selector: &'a str, fields: &'a [&'a str]) -> Self {
        Self {
            selector,
            node: None,
            fields,
        }
    }

    pub fn on_node(mut self, node: &'a str) -> Self {
        self.node = Some(node);
        self
    }
}

/// A local port forwarded into the cluster; the forwarding process dies with
/// this value.
#[derive(Debug)]
pub struct Tunnel {
    pub local_port: u16,
    _process: Option<Child>,
}

impl Tunnel {
    pub fn new(local_port: u16, process: Child) -> Self {
        Self {
            local_port,
            _process: Some(process),
        }
    }

    /// A tunnel with no process behind it (already reachable port).
    pub fn detached(local_port: u16) -> Self {
        Self {
            local_port,
            _process: None,
        }
    }
}

#[async_trait]
pub trait ClusterControl: Send + Sync {
    async fn submit_manifest(&self, path: &Path) -> Result<(), ClusterError>;

    /// One row per matching pod, one column per requested field.
    async fn query_pods(&self, query: PodQuery<'_>) -> Result<Vec<Vec<String>>, ClusterError>;

    async fn query_service_field(&self, selector: &str, field: &str) -> Result<Vec<String>, ClusterError>;

    async fn query_node_field(&self, field: &str) -> Result<Vec<String>, ClusterError>;

    /// Logs of the single pod matching `selector`.
    async fn fetch_logs(&self, selector: &str) -> Result<Vec<u8>, ClusterError>;

    async fn delete_by_label(&self, kinds: &[&str], selector: &str) -> Result<(), ClusterError>;

    /// Waits a bounded time for the forward to report its local port.
    async fn establish_tunnel(&self, target: &str, target_port: u16) -> Result<Tunnel, ClusterError>;

    async fn query_pod_field(&self, selector: &str, field: &str) -> Result<Vec<String>, ClusterError> {
        let fields = [field];
        let rows = self.query_pods(PodQuery::new(selector, &fields)).await?;
        Ok(rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
    }
}
