//! kubenetbench controller
//!
//! Renders benchmark manifests with an indentation-aware template composer,
//! drives them through a cluster's control plane and gathers perf data from
//! the node agents of the session.

pub mod benchmark;
pub mod cluster;
pub mod collection;
pub mod config;
pub mod exec;
pub mod labels;
pub mod manifest;
pub mod placement;
pub mod run;
pub mod session;
pub mod template;

pub use collection::{AgentConnector, AgentSession, CollectionCoordinator, CollectionError, CollectionPolicy};
pub use config::KnbConfig;
pub use run::{RunController, RunEnv, RunError, RunPolicy, RunReport, RunSpec, Topology};
pub use session::{Session, SessionController, SessionError};
