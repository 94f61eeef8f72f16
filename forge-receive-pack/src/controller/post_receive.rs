use crate::classify::{classify, is_forced, ChangedRefs};
use crate::config::PullReqFlow;
use crate::git::ReadParams;
use crate::hooks::{ExtenderContext, HookInput, HookOutput};
use crate::refs::{RefType, RefUpdate};
use crate::store::{update_opt_lock, PullReqFilter, RepoState, Repository};
use crate::Error;

use super::{Controller, EMPTY_REPO_ERROR};

/// Open pull requests listed when suggesting; one more than needed to tell "one" from "several".
const SUGGESTION_PR_LIMIT: usize = 2;

impl Controller {
    /// Report an accepted push. Every step is best effort: the refs already moved, so failures
    /// are logged and never turned into an error.
    pub(super) async fn run_post_receive(&self, input: &HookInput) -> HookOutput {
        let mut out = HookOutput::default();
        let repo = match self.stores.repos.find(input.repo_id).await {
            Ok(repo) => repo,
            Err(err) => {
                tracing::warn!(error = %err, "post-receive could not load repository");
                return out;
            }
        };
        let params = input.read_params(self.server.repo_dir(&repo.git_uid));

        let repo = self.promote_empty_repo(repo, input, &mut out).await;
        if repo.state == RepoState::Active {
            self.report_ref_events(&repo, input, &params).await;
        }
        if let Err(err) = self.suggest_pull_request(&repo, input, &mut out).await {
            tracing::warn!(error = %err, "pull request suggestion failed");
        }

        // Only the extender needs more of the pusher than its id.
        let principal = match self.stores.principals.find(input.principal_id).await {
            Ok(principal) => principal,
            Err(err) => {
                tracing::warn!(error = %err, "post-receive could not load principal, skipping extender");
                return out;
            }
        };
        let changes: ChangedRefs = classify(&input.ref_updates, &[]);
        let ctx = ExtenderContext {
            repo: &repo,
            principal: &principal,
            input,
            changes: &changes,
        };
        if let Err(err) = self.post_extender.extend(ctx, &mut out).await {
            tracing::warn!(error = %err, "post-receive extender failed");
        }
        out
    }

    /// Make the first pushed branch the default of an empty repository, preferring one named
    /// like the placeholder default.
    async fn promote_empty_repo(&self, repo: Repository, input: &HookInput, out: &mut HookOutput) -> Repository {
        if !repo.is_empty {
            return repo;
        }
        let pushed: Vec<&str> = input
            .ref_updates
            .iter()
            .filter(|u| !u.is_delete())
            .filter_map(RefUpdate::branch_name)
            .collect();
        let chosen = pushed
            .iter()
            .find(|name| **name == repo.default_branch)
            .or_else(|| pushed.first())
            .map(|name| (*name).to_owned());
        let Some(new_default) = chosen else {
            out.reject(EMPTY_REPO_ERROR);
            return repo;
        };

        let old_name = repo.default_branch.clone();
        let updated = update_opt_lock(self.stores.repos.as_ref(), repo.clone(), |r| {
            r.is_empty = false;
            r.default_branch.clone_from(&new_default);
            Ok(())
        })
        .await;
        match updated {
            Ok(updated) => {
                tracing::info!(repo_id = updated.id, branch = %updated.default_branch, "empty repository received its first branch");
                if updated.default_branch != old_name {
                    self.reporter
                        .default_branch_updated(updated.id, input.principal_id, old_name, updated.default_branch.clone())
                        .await;
                }
                updated
            }
            Err(err) => {
                tracing::warn!(
                    repo_id = repo.id,
                    branch = %new_default,
                    error = %err,
                    "failed to promote default branch of empty repository"
                );
                repo
            }
        }
    }

    /// Publish one event per branch or tag update, in push order.
    async fn report_ref_events(&self, repo: &Repository, input: &HookInput, params: &ReadParams) {
        let principal_id = input.principal_id;
        for update in &input.ref_updates {
            let (old, new) = (update.old.to_string(), update.new.to_string());
            match update.ref_type() {
                RefType::Branch if update.is_create() => {
                    if self.flow == PullReqFlow::Zentao && self.has_single_open_pr(repo, update).await {
                        tracing::debug!(ref_name = %update.name, "branch opened together with its pull request, not announced");
                        continue;
                    }
                    self.reporter.branch_created(repo.id, principal_id, &update.name, new).await;
                }
                RefType::Branch if update.is_delete() => {
                    self.reporter.branch_deleted(repo.id, principal_id, &update.name, old).await;
                }
                RefType::Branch => {
                    let forced = is_forced(self.git.as_ref(), params, update).await;
                    self.reporter
                        .branch_updated(repo.id, principal_id, &update.name, old, new, forced)
                        .await;
                }
                RefType::Tag if update.is_create() => {
                    self.reporter.tag_created(repo.id, principal_id, &update.name, new).await;
                }
                RefType::Tag if update.is_delete() => {
                    self.reporter.tag_deleted(repo.id, principal_id, &update.name, old).await;
                }
                RefType::Tag => {
                    self.reporter.tag_updated(repo.id, principal_id, &update.name, old, new).await;
                }
                RefType::Other => {}
            }
        }
    }

    async fn has_single_open_pr(&self, repo: &Repository, update: &RefUpdate) -> bool {
        let Some(branch) = update.branch_name() else {
            return false;
        };
        match self.stores.pullreqs.count(&PullReqFilter::open_from(repo.id, branch)).await {
            Ok(count) => count == 1,
            Err(err) => {
                tracing::warn!(ref_name = %update.name, error = %err, "counting open pull requests failed");
                false
            }
        }
    }

    /// Point the user at the open pull requests of a pushed branch, or at the page to open one.
    async fn suggest_pull_request(&self, repo: &Repository, input: &HookInput, out: &mut HookOutput) -> Result<(), Error> {
        let [update] = input.ref_updates.as_slice() else {
            return Ok(());
        };
        if update.is_delete() {
            return Ok(());
        }
        let Some(branch) = update.branch_name() else {
            return Ok(());
        };
        if branch == repo.default_branch {
            return Ok(());
        }

        let filter = PullReqFilter {
            limit: SUGGESTION_PR_LIMIT,
            ..PullReqFilter::open_from(repo.id, branch)
        };
        let prs = self.stores.pullreqs.list(&filter).await?;
        if prs.is_empty() {
            out.message(format!("Create a pull request for {branch:?} by visiting:"));
            out.message(format!(
                "  {}",
                self.urls.compare_url(&repo.path, &repo.default_branch, branch)
            ));
            return Ok(());
        }
        tracing::debug!(pr_count = prs.len(), branch, "branch has open pull requests");
        out.message(format!("Branch {branch:?} has open PRs:"));
        for pr in &prs {
            out.message(format!("  (#{}) {}", pr.number, pr.title));
            out.message(format!("    {}", self.urls.pull_req_url(&repo.path, pr.number)));
        }
        Ok(())
    }
}
