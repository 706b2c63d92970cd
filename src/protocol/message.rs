//! Broker/worker messages with a typed payload per message kind.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{GroupId, ResourceLimits, TaskId};
use crate::util::clock::now_ms;

/// Numeric type tags carried on the wire.
pub mod tags {
    /// TASK_FINISHED
    pub const TASK_FINISHED: u16 = 1;
    /// KILL_WORKER
    pub const KILL_WORKER: u16 = 2;
    /// ERROR
    pub const ERROR: u16 = 3;
    /// ACK
    pub const ACK: u16 = 4;
    /// WORKER_SHUTDOWN
    pub const WORKER_SHUTDOWN: u16 = 5;
    /// CONNECTION_REQUEST
    pub const CONNECTION_REQUEST: u16 = 6;
    /// TASK_ASSIGNED
    pub const TASK_ASSIGNED: u16 = 7;
    /// WORKER_PING
    pub const WORKER_PING: u16 = 8;
    /// SNAPSHOT_DOWNLOAD_REQUEST
    pub const SNAPSHOT_DOWNLOAD_REQUEST: u16 = 9;
    /// SNAPSHOT_DOWNLOAD_RESPONSE
    pub const SNAPSHOT_DOWNLOAD_RESPONSE: u16 = 10;
    /// DOWNLOAD_CODEPOOL
    pub const DOWNLOAD_CODEPOOL: u16 = 11;
    /// DOWNLOAD_CODEPOOL_RESPONSE
    pub const DOWNLOAD_CODEPOOL_RESPONSE: u16 = 12;
    /// SASL_TOKEN_MESSAGE_REQUEST
    pub const SASL_TOKEN_MESSAGE_REQUEST: u16 = 100;
    /// SASL_TOKEN_SERVER_RESPONSE
    pub const SASL_TOKEN_SERVER_RESPONSE: u16 = 101;
    /// SASL_TOKEN_MESSAGE_TOKEN
    pub const SASL_TOKEN_MESSAGE_TOKEN: u16 = 102;
}

/// Constraint set a worker advertises on connect and on every ping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapacity {
    /// Maximum concurrently running tasks.
    pub max_threads: u32,
    /// Maximum running tasks per type; `any` covers unlisted types.
    pub max_threads_by_task_type: HashMap<String, u32>,
    /// Accepted groups in priority order.
    pub groups: Vec<GroupId>,
    /// Groups never matched through the wildcard group.
    pub excluded_groups: HashSet<GroupId>,
    /// Per-resource ceilings on the worker.
    pub resource_limits: ResourceLimits,
}

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedTask {
    /// Task id.
    pub task_id: TaskId,
    /// Task type, selects the executor.
    pub task_type: String,
    /// Submitting user.
    pub user_id: String,
    /// Opaque task parameter.
    pub parameter: String,
}

/// Structured error carried across processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Coarse category, e.g. `protocol`, `auth`, `execution`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Extra diagnostic text from the remote side.
    pub diagnostic: Option<String>,
}

impl RemoteError {
    /// Error without diagnostic text.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            diagnostic: None,
        }
    }

    /// Build from an `anyhow` error, keeping the cause chain as diagnostic.
    pub fn from_anyhow(kind: impl Into<String>, err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        Self {
            kind: kind.into(),
            message: err.to_string(),
            diagnostic: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Final state of a task reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// Executor returned normally.
    Finished,
    /// Executor failed.
    Error,
}

/// Outcome of one task in a TASK_FINISHED batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task id.
    pub task_id: TaskId,
    /// Final status.
    pub status: FinalStatus,
    /// Result payload on success.
    pub result: Option<String>,
    /// Failure details.
    pub error: Option<RemoteError>,
}

/// Typed payload of each message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    /// Worker reports completed tasks.
    TaskFinished {
        /// Reporting process.
        process_id: String,
        /// One entry per finished task.
        results: Vec<TaskResult>,
    },
    /// Broker orders the worker to terminate.
    KillWorker,
    /// Failure reply.
    Error(RemoteError),
    /// Positive reply.
    Ack,
    /// Worker is going away.
    WorkerShutdown,
    /// Worker registration.
    ConnectionRequest {
        /// Stable worker id.
        worker_id: String,
        /// Process id of this worker incarnation.
        process_id: String,
        /// Where the worker runs.
        location: String,
        /// Shared secret.
        shared_secret: String,
        /// Tasks the worker is still running from a previous session.
        running_tasks: BTreeSet<TaskId>,
        /// Constraint set.
        capacity: WorkerCapacity,
        /// Client implementation tag.
        client_type: String,
    },
    /// Broker hands a task to the worker.
    TaskAssigned(AssignedTask),
    /// Periodic poll; updates the constraint set and asks for work.
    WorkerPing {
        /// Polling process.
        process_id: String,
        /// Current constraint set.
        capacity: WorkerCapacity,
    },
    /// Request a broker snapshot.
    SnapshotDownloadRequest,
    /// Snapshot bytes.
    SnapshotDownloadResponse {
        /// Serialized snapshot.
        data: Vec<u8>,
    },
    /// Request a code pool.
    DownloadCodepool {
        /// Code pool id.
        code_pool_id: String,
    },
    /// Code pool bytes.
    DownloadCodepoolResponse {
        /// Packed code pool.
        data: Vec<u8>,
    },
    /// First SASL token from the client.
    SaslTokenMessageRequest {
        /// Mechanism name.
        mech: String,
        /// Initial token.
        token: Vec<u8>,
        /// Sender clock, ms since epoch.
        timestamp_ms: u64,
    },
    /// Server SASL challenge.
    SaslTokenServerResponse {
        /// Challenge token.
        token: Vec<u8>,
        /// Sender clock, ms since epoch.
        timestamp_ms: u64,
    },
    /// Follow-up SASL token from the client.
    SaslTokenMessageToken {
        /// Response token.
        token: Vec<u8>,
        /// Sender clock, ms since epoch.
        timestamp_ms: u64,
    },
}

impl MessageBody {
    /// Numeric type tag.
    pub const fn type_tag(&self) -> u16 {
        match self {
            Self::TaskFinished { .. } => tags::TASK_FINISHED,
            Self::KillWorker => tags::KILL_WORKER,
            Self::Error(_) => tags::ERROR,
            Self::Ack => tags::ACK,
            Self::WorkerShutdown => tags::WORKER_SHUTDOWN,
            Self::ConnectionRequest { .. } => tags::CONNECTION_REQUEST,
            Self::TaskAssigned(_) => tags::TASK_ASSIGNED,
            Self::WorkerPing { .. } => tags::WORKER_PING,
            Self::SnapshotDownloadRequest => tags::SNAPSHOT_DOWNLOAD_REQUEST,
            Self::SnapshotDownloadResponse { .. } => tags::SNAPSHOT_DOWNLOAD_RESPONSE,
            Self::DownloadCodepool { .. } => tags::DOWNLOAD_CODEPOOL,
            Self::DownloadCodepoolResponse { .. } => tags::DOWNLOAD_CODEPOOL_RESPONSE,
            Self::SaslTokenMessageRequest { .. } => tags::SASL_TOKEN_MESSAGE_REQUEST,
            Self::SaslTokenServerResponse { .. } => tags::SASL_TOKEN_SERVER_RESPONSE,
            Self::SaslTokenMessageToken { .. } => tags::SASL_TOKEN_MESSAGE_TOKEN,
        }
    }

    /// Upper-case name used in logs.
    pub const fn type_name(&self) -> &'static str {
        type_name(self.type_tag())
    }
}

/// Name for a numeric type tag; unknown tags map to `"?"`.
pub const fn type_name(tag: u16) -> &'static str {
    match tag {
        tags::TASK_FINISHED => "TASK_FINISHED",
        tags::KILL_WORKER => "KILL_WORKER",
        tags::ERROR => "ERROR",
        tags::ACK => "ACK",
        tags::WORKER_SHUTDOWN => "WORKER_SHUTDOWN",
        tags::CONNECTION_REQUEST => "CONNECTION_REQUEST",
        tags::TASK_ASSIGNED => "TASK_ASSIGNED",
        tags::WORKER_PING => "WORKER_PING",
        tags::SNAPSHOT_DOWNLOAD_REQUEST => "SNAPSHOT_DOWNLOAD_REQUEST",
        tags::SNAPSHOT_DOWNLOAD_RESPONSE => "SNAPSHOT_DOWNLOAD_RESPONSE",
        tags::DOWNLOAD_CODEPOOL => "DOWNLOAD_CODEPOOL",
        tags::DOWNLOAD_CODEPOOL_RESPONSE => "DOWNLOAD_CODEPOOL_RESPONSE",
        tags::SASL_TOKEN_MESSAGE_REQUEST => "SASL_TOKEN_MESSAGE_REQUEST",
        tags::SASL_TOKEN_SERVER_RESPONSE => "SASL_TOKEN_SERVER_RESPONSE",
        tags::SASL_TOKEN_MESSAGE_TOKEN => "SASL_TOKEN_MESSAGE_TOKEN",
        _ => "?",
    }
}

/// A message between broker and worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id of this message.
    pub message_id: String,
    /// Id of the message this one answers.
    pub reply_message_id: Option<String>,
    /// Worker process the message concerns, if any.
    pub worker_process_id: Option<String>,
    /// Typed payload.
    pub body: MessageBody,
}

impl Message {
    /// New message with a fresh id.
    pub fn new(worker_process_id: Option<String>, body: MessageBody) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            reply_message_id: None,
            worker_process_id,
            body,
        }
    }

    /// Reply correlated with `self`, addressed to the same worker process.
    pub fn reply(&self, body: MessageBody) -> Self {
        Self {
            reply_message_id: Some(self.message_id.clone()),
            ..Self::new(self.worker_process_id.clone(), body)
        }
    }

    /// Numeric type tag of the payload.
    pub const fn type_tag(&self) -> u16 {
        self.body.type_tag()
    }

    /// CONNECTION_REQUEST
    pub fn connection_request(
        worker_id: impl Into<String>,
        process_id: impl Into<String>,
        location: impl Into<String>,
        shared_secret: impl Into<String>,
        running_tasks: BTreeSet<TaskId>,
        capacity: WorkerCapacity,
    ) -> Self {
        let process_id = process_id.into();
        Self::new(
            Some(process_id.clone()),
            MessageBody::ConnectionRequest {
                worker_id: worker_id.into(),
                process_id,
                location: location.into(),
                shared_secret: shared_secret.into(),
                running_tasks,
                capacity,
                client_type: "worker".into(),
            },
        )
    }

    /// WORKER_PING
    pub fn worker_ping(process_id: impl Into<String>, capacity: WorkerCapacity) -> Self {
        let process_id = process_id.into();
        Self::new(
            Some(process_id.clone()),
            MessageBody::WorkerPing {
                process_id,
                capacity,
            },
        )
    }

    /// TASK_FINISHED
    pub fn task_finished(process_id: impl Into<String>, results: Vec<TaskResult>) -> Self {
        let process_id = process_id.into();
        Self::new(
            Some(process_id.clone()),
            MessageBody::TaskFinished {
                process_id,
                results,
            },
        )
    }

    /// TASK_ASSIGNED
    pub fn task_assigned(process_id: impl Into<String>, task: AssignedTask) -> Self {
        Self::new(Some(process_id.into()), MessageBody::TaskAssigned(task))
    }

    /// WORKER_SHUTDOWN
    pub fn worker_shutdown(process_id: impl Into<String>) -> Self {
        Self::new(Some(process_id.into()), MessageBody::WorkerShutdown)
    }

    /// SASL_TOKEN_MESSAGE_REQUEST, stamped with the current time.
    pub fn sasl_token_request(mech: impl Into<String>, token: Vec<u8>) -> Self {
        Self::new(
            None,
            MessageBody::SaslTokenMessageRequest {
                mech: mech.into(),
                token,
                timestamp_ms: u64::try_from(now_ms()).unwrap_or(u64::MAX),
            },
        )
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from JSON; the typed body validates the payload shape.
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.body.type_name(), self.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags() {
        assert_eq!(MessageBody::Ack.type_tag(), 4);
        assert_eq!(MessageBody::KillWorker.type_name(), "KILL_WORKER");
        assert_eq!(
            Message::sasl_token_request("PLAIN", vec![1]).type_tag(),
            tags::SASL_TOKEN_MESSAGE_REQUEST
        );
        assert_eq!(type_name(999), "?");
    }

    #[test]
    fn test_reply_correlates_ids() {
        let ping = Message::worker_ping("proc-1", WorkerCapacity::default());
        let ack = ping.reply(MessageBody::Ack);
        assert_eq!(ack.reply_message_id.as_deref(), Some(ping.message_id.as_str()));
        assert_eq!(ack.worker_process_id.as_deref(), Some("proc-1"));
        assert_ne!(ack.message_id, ping.message_id);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let err = Message::from_json(
            r#"{"message_id":"m","reply_message_id":null,"worker_process_id":null,
                "body":{"type":"WORKER_PING","process_id":"p"}}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_remote_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("pool exhausted").context("task 7 failed");
        let remote = RemoteError::from_anyhow("execution", &err);
        assert_eq!(remote.message, "task 7 failed");
        assert_eq!(remote.diagnostic.as_deref(), Some("pool exhausted"));
    }
}
