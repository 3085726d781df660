//! kubenetbench collection agent
//!
//! Runs on every node as a DaemonSet pod. The controller asks it to record
//! perf data for the length of a benchmark and later fetches the packaged
//! archive. Records are keyed by collection id (the run id).

pub mod execution;
pub mod metrics;
pub mod protocol;
pub mod recorder;
pub mod server;
pub mod store;

pub use recorder::{Recorder, ScriptRecorder};
pub use server::{router, serve, serve_on, AgentState};
pub use store::{ClaimError, CollectionState, CollectionStore};
