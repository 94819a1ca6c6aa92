//! Node orchestration and the query surface

pub mod service;

pub use service::{
    with_deadline, MiningInfo, NodeError, NodeService, NodeStatus, SubmitOutcome,
};
