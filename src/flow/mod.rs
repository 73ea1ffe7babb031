/// Flow definition model
///
/// Types, publish-time validation, SQLite storage and the hot-reload registry.

pub mod registry;
pub mod storage;
pub mod types;
pub mod validate;

pub use registry::{CompiledFlow, FlowRegistry};
pub use storage::{FlowStorage, FlowSummary};
pub use types::{
    ConcurrencyPolicy, ConflictPolicy, Edge, FlowDefinition, FlowStatus, LockScope, Node, NodeKind,
};
pub use validate::validate_flow;
