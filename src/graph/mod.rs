//! G1: the deterministic node-graph engine. Node types register a small
//! vtable of function pointers ([`registry`]) so the hierarchy ([`hierarchy`])
//! can pack instances as raw bytes, phase by phase, and dispatch execution
//! without a `Box<dyn Node>` per element (§3, §4.8).

pub mod hierarchy;
pub mod registry;

pub use hierarchy::NodeHierarchy;
pub use registry::{make_key, CopyFn, ClearFn, EntryFn, NodeRegistry, NodeTypeKey, NodeVTable};
