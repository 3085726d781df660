//! One-call setup for controller tests: a session in a temporary directory
//! wired to the mock control plane and the in-memory agents.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use knb_controller::benchmark::{BenchmarkConf, NetperfConf, NetperfTest};
use knb_controller::config::KnbConfig;
use knb_controller::placement::{Affinity, ContainerSpec};
use knb_controller::{RunSpec, Session, SessionController, Topology};

use crate::mock_agents::MockAgents;
use crate::mock_cluster::MockCluster;

pub const SESSION_ID: &str = "test";

pub struct TestHarness {
    // keeps the session directory alive
    _base: TempDir,
    pub session: Session,
    pub cluster: Arc<MockCluster>,
    pub agents: Arc<MockAgents>,
    pub cancel: CancellationToken,
    pub config: KnbConfig,
}

impl TestHarness {
    pub async fn new(cluster: MockCluster, agents: MockAgents) -> Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let base = tempfile::tempdir()?;
        let session = Session::init(SESSION_ID, base.path(), false).await?;
        Ok(Self {
            _base: base,
            session,
            cluster: Arc::new(cluster),
            agents: Arc::new(agents),
            cancel: CancellationToken::new(),
            config: Self::config(),
        })
    }

    /// Defaults with ten readiness attempts for both pods and services.
    pub fn config() -> KnbConfig {
        let mut config = KnbConfig::default();
        config.pod_readiness.retries = 9;
        config.service_readiness.retries = 9;
        config
    }

    pub fn session_dir(&self) -> &Path {
        self.session.dir()
    }

    pub fn controller(&self) -> SessionController {
        SessionController::new(
            self.session.clone(),
            self.config.clone(),
            self.cluster.clone(),
            self.agents.clone(),
            self.cancel.clone(),
        )
    }

    /// A 30s netperf TCP_RR run that cleans up after itself.
    pub fn spec(topology: Topology) -> RunSpec {
        let mut netperf = NetperfConf::new(NetperfTest::TcpRr);
        netperf.timeout_secs = 30;
        RunSpec {
            label: topology.name().to_string(),
            topology,
            client: ContainerSpec::client(Affinity::DifferentFromPeer),
            server: ContainerSpec::default(),
            cleanup: true,
            benchmark: BenchmarkConf::Netperf(netperf),
            collect_perf: false,
        }
    }
}
