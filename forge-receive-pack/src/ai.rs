//! Automated review of pushes to branches with an open pull request.
//!
//! The review runs detached from the push: the post-receive hook only schedules it, the provider
//! call is bounded by [`AiConfig::review_timeout`], and every failure ends in a log line.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::task::TaskTracker;

use crate::config::AiConfig;
use crate::hooks::{ExtenderContext, HookOutput, PostReceiveExtender};
use crate::store::{repo_bool, settings, PullReq, PullReqFilter, PullReqStore, SettingsStore};
use crate::Error;

/// Appended to comments cut at the configured maximum length.
pub const TRUNCATION_MARKER: &str = "\n\n(review truncated)";

/// What a review is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub repo_id: i64,
    pub pullreq_id: i64,
    pub number: i64,
    pub target_branch: String,
    pub source_branch: String,
    /// The pushed tip.
    pub source_sha: String,
}

/// Produces a review comment, typically by calling an external model.
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    async fn review(&self, request: &ReviewRequest) -> Result<String, Error>;
}

/// Where finished reviews go.
#[async_trait]
pub trait ReviewSink: Send + Sync {
    async fn post_comment(&self, pr: &PullReq, body: &str) -> Result<(), Error>;
}

/// Schedules a review when the single pushed branch has an open pull request.
#[derive(Clone)]
pub struct AiReviewExtender {
    settings: Arc<dyn SettingsStore>,
    pullreqs: Arc<dyn PullReqStore>,
    provider: Arc<dyn ReviewProvider>,
    sink: Arc<dyn ReviewSink>,
    config: AiConfig,
    tasks: TaskTracker,
}

impl AiReviewExtender {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        pullreqs: Arc<dyn PullReqStore>,
        provider: Arc<dyn ReviewProvider>,
        sink: Arc<dyn ReviewSink>,
        config: AiConfig,
    ) -> Self {
        AiReviewExtender {
            settings,
            pullreqs,
            provider,
            sink,
            config,
            tasks: TaskTracker::new(),
        }
    }

    /// The reviews in flight; close and wait on it to drain them.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    async fn run(self, pr: PullReq, request: ReviewRequest) {
        let review = tokio::time::timeout(self.config.review_timeout, self.provider.review(&request)).await;
        let body = match review {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => {
                tracing::warn!(pullreq_id = pr.id, error = %err, "ai review failed");
                return;
            }
            Err(_) => {
                tracing::warn!(
                    pullreq_id = pr.id,
                    timeout = ?self.config.review_timeout,
                    "ai review timed out"
                );
                return;
            }
        };
        let body = match truncate(&body, self.config.max_comment_length) {
            Some(cut) => {
                tracing::warn!(
                    pullreq_id = pr.id,
                    length = body.chars().count(),
                    max = self.config.max_comment_length,
                    "ai review truncated"
                );
                cut
            }
            None => body,
        };
        if let Err(err) = self.sink.post_comment(&pr, &body).await {
            tracing::warn!(pullreq_id = pr.id, error = %err, "posting ai review failed");
        }
    }
}

/// `body` cut to at most `max` characters including [`TRUNCATION_MARKER`], or `None` if it fits.
///
/// A `max` too small for the marker cuts the body without one.
pub fn truncate(body: &str, max: usize) -> Option<String> {
    if body.chars().count() <= max {
        return None;
    }
    let marker = TRUNCATION_MARKER.chars().count();
    if max <= marker {
        return Some(prefix(body, max).to_owned());
    }
    Some(format!("{}{TRUNCATION_MARKER}", prefix(body, max - marker)))
}

/// The first `chars` characters of `s`.
fn prefix(s: &str, chars: usize) -> &str {
    &s[..s.char_indices().nth(chars).map_or(s.len(), |(idx, _)| idx)]
}

#[async_trait]
impl PostReceiveExtender for AiReviewExtender {
    async fn extend(&self, ctx: ExtenderContext<'_>, _out: &mut HookOutput) -> Result<(), Error> {
        let [update] = ctx.input.ref_updates.as_slice() else {
            return Ok(());
        };
        let Some(branch) = update.branch_name() else {
            return Ok(());
        };
        if update.is_delete() {
            return Ok(());
        }
        if !repo_bool(self.settings.as_ref(), ctx.repo.id, settings::AI_REVIEW_ENABLED, false).await? {
            return Ok(());
        }
        let filter = PullReqFilter {
            limit: 1,
            ..PullReqFilter::open_from(ctx.repo.id, branch)
        };
        let Some(pr) = self.pullreqs.list(&filter).await?.into_iter().next() else {
            return Ok(());
        };
        let request = ReviewRequest {
            repo_id: ctx.repo.id,
            pullreq_id: pr.id,
            number: pr.number,
            target_branch: pr.target_branch.clone(),
            source_branch: branch.to_owned(),
            source_sha: update.new.to_string(),
        };
        tracing::debug!(pullreq_id = pr.id, number = pr.number, "scheduling ai review");
        self.tasks.spawn(self.clone().run(pr, request));
        Ok(())
    }
}

impl std::fmt::Debug for AiReviewExtender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiReviewExtender")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
