/*!
# knb-devkit

Test doubles for kubenetbench:
- `MockCluster`, a scripted control plane that records every call
- `MockAgents`, node agents backed by the agent's own collection store
- `TestHarness`, a session in a temporary directory wired to both
*/

pub mod harness;
pub mod mock_agents;
pub mod mock_cluster;

pub use harness::TestHarness;
pub use mock_agents::{AgentCall, MockAgents};
pub use mock_cluster::{ClusterCall, MockCluster, Reply};
