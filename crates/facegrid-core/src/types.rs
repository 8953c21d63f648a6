//! Domain types that cross the queue, blob, and instance boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for a job: the uploaded filename with its last extension removed.
pub type JobId = String;

/// Identifier for a compute instance in the worker pool.
pub type InstanceId = String;

/// Separator between job id and label in a response message body.
pub const RESPONSE_SEPARATOR: char = ':';

/// Derive a job id from a filename by stripping its last extension.
///
/// Only the final path component is considered, and leading dots do not
/// start an extension, so `.env` stays `.env` while `a.b.jpg` becomes `a.b`.
pub fn job_id_from_filename(filename: &str) -> JobId {
    let base_start = filename.rfind('/').map_or(0, |i| i + 1);
    let base = &filename[base_start..];
    let leading_dots = base.len() - base.trim_start_matches('.').len();

    match base[leading_dots..].rfind('.') {
        Some(dot) => filename[..base_start + leading_dots + dot].to_string(),
        None => filename.to_string(),
    }
}

// ── Queue messages ─────────────────────────────────────────────────

/// A job request as carried on the request queue.
///
/// The body is the full filename so the worker can fetch the input blob
/// and derive the job id on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    pub filename: String,
}

impl RequestMessage {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    /// Parse a request from a raw queue body. Surrounding whitespace is ignored.
    pub fn from_body(body: &str) -> Self {
        Self::new(body.trim())
    }

    pub fn job_id(&self) -> JobId {
        job_id_from_filename(&self.filename)
    }

    pub fn body(&self) -> &str {
        &self.filename
    }
}

/// A job result as carried on the response queue: `job_id:label`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub job_id: JobId,
    pub label: String,
}

impl ResponseMessage {
    pub fn new(job_id: impl Into<JobId>, label: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            label: label.into(),
        }
    }

    /// Split a body on its first separator.
    ///
    /// Returns `None` for bodies without a separator; those are malformed
    /// and get dropped by the consumer.
    pub fn parse(body: &str) -> Option<Self> {
        body.split_once(RESPONSE_SEPARATOR)
            .map(|(job_id, label)| Self::new(job_id, label))
    }

    pub fn body(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResponseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.job_id, RESPONSE_SEPARATOR, self.label)
    }
}

/// Opaque token used to delete a received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed out by `QueueService::receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub body: String,
    pub receipt: ReceiptHandle,
}

// ── Recognition ────────────────────────────────────────────────────

/// Output of the recognition function.
///
/// Only `label` leaves the worker; `distance` is logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub label: String,
    pub distance: f32,
}

// ── Instances ──────────────────────────────────────────────────────

/// Lifecycle state of a compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

impl InstanceState {
    /// Running or on its way there.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Pending)
    }

    /// States the autoscaler is allowed to act on.
    pub fn is_controllable(self) -> bool {
        matches!(self, Self::Running | Self::Pending | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pre-provisioned compute instance belonging to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Value of the pool-membership name tag.
    pub name: String,
    pub state: InstanceState,
}

impl Instance {
    pub fn new(id: impl Into<InstanceId>, name: impl Into<String>, state: InstanceState) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state,
        }
    }
}
