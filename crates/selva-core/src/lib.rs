//! Foundational, dependency-light types shared by the hierarchy store and
//! its collaborators: the fixed-width node id and the wall-clock timestamp
//! used throughout the object store and auto-indexing engine.

#[macro_use]
pub mod macros;
pub mod id;
pub mod timestamp;

pub use id::{NODE_ID_LEN, NODE_TYPE_CODE_LEN, NodeId, NodeIdParseError, ROOT_NODE_ID};
pub use timestamp::Timestamp;
