//! Message contract between the broker and its workers.
//!
//! Every message kind has its own payload schema; payloads are validated when
//! decoded instead of being threaded through as untyped maps.

pub mod message;

pub use message::{
    tags, type_name, AssignedTask, FinalStatus, Message, MessageBody, RemoteError, TaskResult,
    WorkerCapacity,
};
