//! Publishing of domain events on behalf of the pipeline.

use std::sync::Arc;

use serde::Serialize;

use super::dispatch::{DeadLetter, DeadLetters};
use super::{
    DefaultBranchUpdatedPayload, EventKind, EventStream, Record, RefCreatedPayload, RefDeletedPayload,
    RefUpdatedPayload,
};
use crate::error::RetryStrategy;
use crate::Error;

/// Appends events to the stream, retrying failed appends and dead-lettering what cannot be
/// stored. Publishing never fails; callers learn nothing about the outcome.
#[derive(Clone)]
pub struct Reporter {
    stream: Arc<dyn EventStream>,
    source_id: String,
    retry: RetryStrategy,
    dead_letters: DeadLetters,
}

impl Reporter {
    pub fn new(stream: Arc<dyn EventStream>, source_id: impl Into<String>, max_attempts: u32) -> Self {
        Reporter {
            stream,
            source_id: source_id.into(),
            retry: RetryStrategy::ExponentialBackoff { max_attempts },
            dead_letters: DeadLetters::default(),
        }
    }

    pub fn stream(&self) -> &Arc<dyn EventStream> {
        &self.stream
    }

    /// Records that could not be appended.
    pub fn dead_letters(&self) -> &DeadLetters {
        &self.dead_letters
    }

    /// Publish an event of `kind`, returning once it is stored or given up on.
    pub async fn publish(&self, kind: EventKind, payload: &impl Serialize) {
        let record = match Record::new(kind, &self.source_id, payload) {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(%kind, error = %err, "dropping unpublishable event");
                return;
            }
        };
        let mut attempt = 1;
        loop {
            match self.stream.append(record.clone()).await {
                Ok(offset) => {
                    tracing::debug!(%kind, offset, "event published");
                    return;
                }
                Err(err) => match self.retry.delay(attempt) {
                    Some(pause) => {
                        tracing::warn!(%kind, attempt, error = %err, "event publish failed, retrying");
                        tokio::time::sleep(pause).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::error!(%kind, attempts = attempt, error = %err, "event publish failed, dead-lettering");
                        self.dead_letter(record, &err);
                        return;
                    }
                },
            }
        }
    }

    fn dead_letter(&self, record: Record, err: &Error) {
        self.dead_letters.push(DeadLetter {
            consumer: None,
            record,
            error: err.to_string(),
        });
    }

    pub async fn branch_created(&self, repo_id: i64, principal_id: i64, ref_name: &str, sha: String) {
        self.publish(EventKind::BranchCreated, &created(repo_id, principal_id, ref_name, sha))
            .await;
    }

    pub async fn branch_updated(&self, repo_id: i64, principal_id: i64, ref_name: &str, old: String, new: String, forced: bool) {
        self.publish(
            EventKind::BranchUpdated,
            &updated(repo_id, principal_id, ref_name, old, new, forced),
        )
        .await;
    }

    pub async fn branch_deleted(&self, repo_id: i64, principal_id: i64, ref_name: &str, sha: String) {
        self.publish(EventKind::BranchDeleted, &deleted(repo_id, principal_id, ref_name, sha))
            .await;
    }

    pub async fn tag_created(&self, repo_id: i64, principal_id: i64, ref_name: &str, sha: String) {
        self.publish(EventKind::TagCreated, &created(repo_id, principal_id, ref_name, sha))
            .await;
    }

    /// Tags never move along history, so their updates are always forced.
    pub async fn tag_updated(&self, repo_id: i64, principal_id: i64, ref_name: &str, old: String, new: String) {
        self.publish(EventKind::TagUpdated, &updated(repo_id, principal_id, ref_name, old, new, true))
            .await;
    }

    pub async fn tag_deleted(&self, repo_id: i64, principal_id: i64, ref_name: &str, sha: String) {
        self.publish(EventKind::TagDeleted, &deleted(repo_id, principal_id, ref_name, sha))
            .await;
    }

    pub async fn default_branch_updated(&self, repo_id: i64, principal_id: i64, old_name: String, new_name: String) {
        self.publish(
            EventKind::DefaultBranchUpdated,
            &DefaultBranchUpdatedPayload {
                repo_id,
                principal_id,
                old_name,
                new_name,
            },
        )
        .await;
    }
}

fn created(repo_id: i64, principal_id: i64, ref_name: &str, sha: String) -> RefCreatedPayload {
    RefCreatedPayload {
        repo_id,
        principal_id,
        ref_name: ref_name.to_owned(),
        sha,
    }
}

fn updated(repo_id: i64, principal_id: i64, ref_name: &str, old_sha: String, new_sha: String, forced: bool) -> RefUpdatedPayload {
    RefUpdatedPayload {
        repo_id,
        principal_id,
        ref_name: ref_name.to_owned(),
        old_sha,
        new_sha,
        forced,
    }
}

fn deleted(repo_id: i64, principal_id: i64, ref_name: &str, sha: String) -> RefDeletedPayload {
    RefDeletedPayload {
        repo_id,
        principal_id,
        ref_name: ref_name.to_owned(),
        sha,
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("source_id", &self.source_id)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
