//! Per-role placement: affinity relative to the peer and host namespaces.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::labels::{Role, RUN_LABEL};
use crate::template::{param, PrefixWriter, TemplateError, Vars};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("unrecognized affinity {0:?} (expected none, same, different or host=<name>)")]
    Unrecognized(String),
    #[error("server affinity must be none or host=<name>, got {0}")]
    ServerAffinity(Affinity),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Affinity {
    #[default]
    None,
    SameAsPeer,
    DifferentFromPeer,
    PinnedToHost(String),
}

impl FromStr for Affinity {
    type Err = PlacementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Affinity::None),
            "same" => Ok(Affinity::SameAsPeer),
            "different" => Ok(Affinity::DifferentFromPeer),
            _ => match s.strip_prefix("host=") {
                Some(host) if !host.is_empty() => Ok(Affinity::PinnedToHost(host.to_string())),
                _ => Err(PlacementError::Unrecognized(s.to_string())),
            },
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Affinity::None => f.write_str("none"),
            Affinity::SameAsPeer => f.write_str("same"),
            Affinity::DifferentFromPeer => f.write_str("different"),
            Affinity::PinnedToHost(host) => write!(f, "host={host}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub affinity: Affinity,
    pub host_network: bool,
    pub host_ipc: bool,
    pub host_pid: bool,
}

impl ContainerSpec {
    pub fn client(affinity: Affinity) -> Self {
        Self {
            affinity,
            ..Self::default()
        }
    }

    /// The server is placed first, so it cannot be relative to the client.
    pub fn server(affinity: Affinity) -> Result<Self, PlacementError> {
        match affinity {
            Affinity::SameAsPeer | Affinity::DifferentFromPeer => Err(PlacementError::ServerAffinity(affinity)),
            _ => Ok(Self {
                affinity,
                ..Self::default()
            }),
        }
    }

    /// Runs in the host's network, IPC and PID namespaces.
    pub fn on_host(mut self) -> Self {
        self.host_network = true;
        self.host_ipc = true;
        self.host_pid = true;
        self
    }

    pub fn write_host_opts(&self, pw: &mut PrefixWriter<'_>, _vars: &Vars) -> Result<(), TemplateError> {
        if self.host_network {
            pw.line("hostNetwork: true")?;
        }
        if self.host_ipc {
            pw.line("hostIPC: true")?;
        }
        if self.host_pid {
            pw.line("hostPID: true")?;
        }
        Ok(())
    }

    /// Affinity toward the run's server pod; needs `runId` in `vars` for
    /// the relative modes.
    pub fn write_affinity(&self, pw: &mut PrefixWriter<'_>, vars: &Vars) -> Result<(), TemplateError> {
        let kind = match &self.affinity {
            Affinity::None => return Ok(()),
            Affinity::PinnedToHost(host) => {
                pw.line("nodeSelector:")?;
                return pw.line(&format!("  kubernetes.io/hostname: {host}"));
            }
            Affinity::SameAsPeer => "podAffinity",
            Affinity::DifferentFromPeer => "podAntiAffinity",
        };
        let run_id = param(vars, "runId")?;

        pw.line("affinity:")?;
        pw.line(&format!("  {kind}:"))?;
        pw.line("    requiredDuringSchedulingIgnoredDuringExecution:")?;
        pw.line("    - labelSelector:")?;
        pw.line("        matchExpressions:")?;
        for (key, value) in [("role", Role::Server.as_str()), (RUN_LABEL, run_id)] {
            pw.line(&format!("        - key: {key}"))?;
            pw.line("          operator: In")?;
            pw.line("          values:")?;
            pw.line(&format!("          - {value}"))?;
        }
        pw.line("      topologyKey: kubernetes.io/hostname")
    }

    /// Server pod spec additions: placement, then host namespaces.
    pub fn write_pod_spec(&self, pw: &mut PrefixWriter<'_>, vars: &Vars) -> Result<(), TemplateError> {
        self.write_affinity(pw, vars)?;
        self.write_host_opts(pw, vars)
    }
}
