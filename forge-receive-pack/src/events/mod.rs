//! Domain events and their durable stream.
//!
//! Accepted pushes turn into events such as `branch.created` that are appended to an
//! [`EventStream`] by the [`Reporter`]. The [`Dispatcher`] feeds stream records to registered
//! [`EventHandler`]s, each at its own pace and offset. Payloads reference entities by id and
//! carry SHAs, consumers look up anything else when they handle the event.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::Error;

pub mod dispatch;
pub mod reporter;
pub mod stream;

pub use dispatch::{DeadLetter, DeadLetters, Dispatcher, EventHandler, FileOffsets, MemoryOffsets, OffsetStore};
pub use reporter::Reporter;
pub use stream::{EventStream, FileStream, MemoryStream};

/// The kinds of events the pipeline and its consumers publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "branch.created")]
    BranchCreated,
    #[serde(rename = "branch.updated")]
    BranchUpdated,
    #[serde(rename = "branch.deleted")]
    BranchDeleted,
    #[serde(rename = "tag.created")]
    TagCreated,
    #[serde(rename = "tag.updated")]
    TagUpdated,
    #[serde(rename = "tag.deleted")]
    TagDeleted,
    #[serde(rename = "repo.default_branch_updated")]
    DefaultBranchUpdated,
    #[serde(rename = "pullreq.created")]
    PullReqCreated,
    #[serde(rename = "pullreq.reopened")]
    PullReqReopened,
    #[serde(rename = "pullreq.branch_updated")]
    PullReqBranchUpdated,
    #[serde(rename = "pullreq.closed")]
    PullReqClosed,
    #[serde(rename = "pullreq.merged")]
    PullReqMerged,
    #[serde(rename = "pullreq.reviewer_added")]
    PullReqReviewerAdded,
    #[serde(rename = "pullreq.reviewer_deleted")]
    PullReqReviewerDeleted,
    #[serde(rename = "pullreq.comment_created")]
    PullReqCommentCreated,
    #[serde(rename = "pullreq.comment_updated")]
    PullReqCommentUpdated,
    #[serde(rename = "pullreq.review_submitted")]
    PullReqReviewSubmitted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BranchCreated => "branch.created",
            EventKind::BranchUpdated => "branch.updated",
            EventKind::BranchDeleted => "branch.deleted",
            EventKind::TagCreated => "tag.created",
            EventKind::TagUpdated => "tag.updated",
            EventKind::TagDeleted => "tag.deleted",
            EventKind::DefaultBranchUpdated => "repo.default_branch_updated",
            EventKind::PullReqCreated => "pullreq.created",
            EventKind::PullReqReopened => "pullreq.reopened",
            EventKind::PullReqBranchUpdated => "pullreq.branch_updated",
            EventKind::PullReqClosed => "pullreq.closed",
            EventKind::PullReqMerged => "pullreq.merged",
            EventKind::PullReqReviewerAdded => "pullreq.reviewer_added",
            EventKind::PullReqReviewerDeleted => "pullreq.reviewer_deleted",
            EventKind::PullReqCommentCreated => "pullreq.comment_created",
            EventKind::PullReqCommentUpdated => "pullreq.comment_updated",
            EventKind::PullReqReviewSubmitted => "pullreq.review_submitted",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What every consumer learns about a record before looking at its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub kind: EventKind,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    /// The instance that published the event.
    pub source_id: String,
}

/// One entry of the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    pub header: Header,
    pub payload: serde_json::Value,
}

impl Record {
    /// A record of `kind` stamped with the current time.
    pub fn new(kind: EventKind, source_id: &str, payload: &impl Serialize) -> Result<Self, Error> {
        Ok(Record {
            header: Header {
                kind,
                timestamp: now_millis(),
                source_id: source_id.to_owned(),
            },
            payload: serde_json::to_value(payload).map_err(|e| Error::Bug(format!("unserializable {kind} payload: {e}")))?,
        })
    }

    pub fn kind(&self) -> EventKind {
        self.header.kind
    }

    /// Decode the payload into the type published for this kind.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Protocol(format!("{} payload: {e}", self.header.kind)))
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Payload of `branch.created` and `tag.created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefCreatedPayload {
    pub repo_id: i64,
    pub principal_id: i64,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

/// Payload of `branch.updated` and `tag.updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefUpdatedPayload {
    pub repo_id: i64,
    pub principal_id: i64,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub old_sha: String,
    pub new_sha: String,
    pub forced: bool,
}

/// Payload of `branch.deleted` and `tag.deleted`, `sha` being the tip before deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefDeletedPayload {
    pub repo_id: i64,
    pub principal_id: i64,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultBranchUpdatedPayload {
    pub repo_id: i64,
    pub principal_id: i64,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReqCreatedPayload {
    pub pullreq_id: i64,
    pub number: i64,
    pub principal_id: i64,
    pub source_repo_id: i64,
    pub target_repo_id: i64,
    pub source_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReqBranchUpdatedPayload {
    pub pullreq_id: i64,
    pub principal_id: i64,
    pub target_repo_id: i64,
    pub old_sha: String,
    pub new_sha: String,
    pub forced: bool,
}
