//! Benchmarks know how to describe their own containers.

mod netperf;

pub use netperf::{Netperf, NetperfConf, NetperfStyle, NetperfTest, CONTROL_PORT, DEFAULT_IMAGE};

use std::time::Duration;

use thiserror::Error;

use crate::template::{PrefixWriter, TemplateError, Vars};

#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("unknown benchmark: {0}")]
    Unknown(String),
    #[error("invalid netperf type {0:?} (available: tcp_rr, tcp_crr, udp_rr, tcp_stream, tcp_maerts, udp_stream)")]
    InvalidNetperfType(String),
    #[error("cannot use multiple streams with client command {0:?}")]
    StreamsUnsupported(String),
}

/// What a run needs from a benchmark: its two container bodies, the ports a
/// service must expose, and how long the client is expected to run.
///
/// Renderers are called at the position after `- ` in a container list (or
/// under `ports:`), so the first line they write lands on the parent's line.
pub trait Benchmark: Send + Sync {
    fn write_server_container(&self, pw: &mut PrefixWriter<'_>, vars: &Vars) -> Result<(), TemplateError>;

    /// Needs `serverIP` in `vars`.
    fn write_client_container(&self, pw: &mut PrefixWriter<'_>, vars: &Vars) -> Result<(), TemplateError>;

    fn write_server_ports(&self, pw: &mut PrefixWriter<'_>, vars: &Vars) -> Result<(), TemplateError>;

    fn duration(&self) -> Duration;
}

/// Benchmark selection made at run setup.
#[derive(Debug, Clone)]
pub enum BenchmarkConf {
    Netperf(NetperfConf),
}

impl BenchmarkConf {
    pub fn build(&self) -> Box<dyn Benchmark> {
        match self {
            BenchmarkConf::Netperf(conf) => Box::new(Netperf::new(conf.clone())),
        }
    }

    /// Ingress ports an isolation policy must leave open.
    pub fn policy_ports(&self) -> Vec<u16> {
        match self {
            BenchmarkConf::Netperf(conf) => vec![CONTROL_PORT, conf.data_port],
        }
    }
}
