//! Pull requests as far as pushes are concerned: opening them and following their source branch.

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::{
    now_millis, EventHandler, EventKind, PullReqBranchUpdatedPayload, PullReqCreatedPayload, Record, RefUpdatedPayload,
    Reporter,
};
use crate::refs::BRANCH_PREFIX;
use crate::store::{
    update_opt_lock, MergeCheckStatus, PullReq, PullReqFilter, PullReqState, PullReqStore, RepoStore,
};
use crate::Error;

/// What a caller provides to open a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullReq {
    pub title: String,
    pub source_repo_id: i64,
    pub source_branch: String,
    pub source_sha: String,
    pub target_repo_id: i64,
    pub target_branch: String,
    pub merge_base_sha: String,
}

/// Creates pull requests with per-repository numbers.
#[derive(Clone)]
pub struct PullReqService {
    repos: Arc<dyn RepoStore>,
    pullreqs: Arc<dyn PullReqStore>,
    reporter: Reporter,
}

impl PullReqService {
    pub fn new(repos: Arc<dyn RepoStore>, pullreqs: Arc<dyn PullReqStore>, reporter: Reporter) -> Self {
        PullReqService {
            repos,
            pullreqs,
            reporter,
        }
    }

    /// Open a pull request on behalf of `principal_id`.
    ///
    /// Fails with [`Error::Conflict`] if an open pull request for the same source and target
    /// exists. The number is taken from the target repository's sequence, so a failed insert
    /// leaves a gap in the numbering.
    pub async fn create(&self, principal_id: i64, new: NewPullReq) -> Result<PullReq, Error> {
        if new.source_repo_id == new.target_repo_id && new.source_branch == new.target_branch {
            return Err(Error::Conflict("source and target branch are the same".into()));
        }
        let existing = PullReqFilter {
            target_repo_id: Some(new.target_repo_id),
            target_branch: Some(new.target_branch.clone()),
            ..PullReqFilter::open_from(new.source_repo_id, &new.source_branch)
        };
        if self.pullreqs.count(&existing).await? > 0 {
            return Err(Error::Conflict(format!(
                "an open pull request from {:?} into {:?} already exists",
                new.source_branch, new.target_branch
            )));
        }

        let target = self.repos.find(new.target_repo_id).await?;
        let target = update_opt_lock(self.repos.as_ref(), target, |repo| {
            repo.pull_req_seq += 1;
            Ok(())
        })
        .await?;

        let pr = self
            .pullreqs
            .create(&PullReq {
                id: 0,
                version: 0,
                number: target.pull_req_seq,
                created_by: principal_id,
                created: now_millis(),
                title: new.title,
                state: PullReqState::Open,
                source_repo_id: new.source_repo_id,
                source_branch: new.source_branch,
                source_sha: new.source_sha,
                target_repo_id: new.target_repo_id,
                target_branch: new.target_branch,
                merge_base_sha: new.merge_base_sha,
                merge_check_status: MergeCheckStatus::Unchecked,
            })
            .await?;
        tracing::info!(pullreq_id = pr.id, number = pr.number, repo_id = pr.target_repo_id, "pull request created");

        self.reporter
            .publish(
                EventKind::PullReqCreated,
                &PullReqCreatedPayload {
                    pullreq_id: pr.id,
                    number: pr.number,
                    principal_id,
                    source_repo_id: pr.source_repo_id,
                    target_repo_id: pr.target_repo_id,
                    source_sha: pr.source_sha.clone(),
                },
            )
            .await;
        Ok(pr)
    }
}

impl std::fmt::Debug for PullReqService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullReqService").finish_non_exhaustive()
    }
}

const SOURCE_UPDATE_ATTEMPTS: u32 = 5;

/// Moves the source SHA of open pull requests along with their pushed source branch.
///
/// Records are delivered at least once; a pull request already at the new SHA is left alone.
#[derive(Clone)]
pub struct SourceBranchFollower {
    pullreqs: Arc<dyn PullReqStore>,
    reporter: Reporter,
}

impl SourceBranchFollower {
    pub fn new(pullreqs: Arc<dyn PullReqStore>, reporter: Reporter) -> Self {
        SourceBranchFollower { pullreqs, reporter }
    }

    async fn move_source(&self, pr: PullReq, new_sha: &str) -> Result<Option<PullReq>, Error> {
        let mut current = pr;
        for _ in 0..SOURCE_UPDATE_ATTEMPTS {
            if current.state != PullReqState::Open || current.source_sha == new_sha {
                return Ok(None);
            }
            let mut next = current.clone();
            next.source_sha = new_sha.to_owned();
            next.merge_check_status = MergeCheckStatus::Unchecked;
            match self.pullreqs.update(&next).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(Error::VersionConflict(_)) => current = self.pullreqs.find(current.id).await?,
                Err(err) => return Err(err),
            }
        }
        Err(Error::VersionConflict(format!("pull request {}", current.id)))
    }
}

#[async_trait]
impl EventHandler for SourceBranchFollower {
    fn name(&self) -> &str {
        "pullreq-source-branch"
    }

    fn kinds(&self) -> &[EventKind] {
        &[EventKind::BranchUpdated]
    }

    async fn handle(&self, record: &Record) -> Result<(), Error> {
        let event: RefUpdatedPayload = record.payload()?;
        let Some(branch) = event.ref_name.strip_prefix(BRANCH_PREFIX) else {
            return Ok(());
        };
        let open = self.pullreqs.list(&PullReqFilter::open_from(event.repo_id, branch)).await?;
        for pr in open {
            let old_sha = pr.source_sha.clone();
            let Some(updated) = self.move_source(pr, &event.new_sha).await? else {
                continue;
            };
            tracing::debug!(pullreq_id = updated.id, branch, forced = event.forced, "pull request source moved");
            self.reporter
                .publish(
                    EventKind::PullReqBranchUpdated,
                    &PullReqBranchUpdatedPayload {
                        pullreq_id: updated.id,
                        principal_id: event.principal_id,
                        target_repo_id: updated.target_repo_id,
                        old_sha,
                        new_sha: updated.source_sha.clone(),
                        forced: event.forced,
                    },
                )
                .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SourceBranchFollower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBranchFollower").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventStream, MemoryStream};
    use crate::store::memory::MemoryStore;
    use crate::store::{RepoState, Repository};
    use pretty_assertions::assert_eq;

    fn repo(id: i64) -> Repository {
        Repository {
            id,
            parent_id: 1,
            identifier: format!("repo{id}"),
            path: format!("space/repo{id}"),
            git_uid: format!("uid{id}"),
            state: RepoState::Active,
            default_branch: "main".into(),
            is_empty: false,
            pull_req_seq: 0,
            mirror: false,
            is_public: false,
            require_fit_client: false,
            size: 0,
            version: 1,
        }
    }

    fn new_pr(branch: &str) -> NewPullReq {
        NewPullReq {
            title: format!("Add {branch}"),
            source_repo_id: 1,
            source_branch: branch.into(),
            source_sha: "a".repeat(40),
            target_repo_id: 1,
            target_branch: "main".into(),
            merge_base_sha: "b".repeat(40),
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryStream>, PullReqService) {
        let store = Arc::new(MemoryStore::new());
        store.insert_repo(repo(1)).unwrap();
        let stream = Arc::new(MemoryStream::new());
        let reporter = Reporter::new(stream.clone(), "test", 3);
        let service = PullReqService::new(store.clone(), store.clone(), reporter);
        (store, stream, service)
    }

    #[tokio::test]
    async fn numbers_come_from_the_target_sequence() {
        let (store, stream, service) = setup();
        let first = service.create(7, new_pr("feat/a")).await.unwrap();
        let second = service.create(7, new_pr("feat/b")).await.unwrap();
        assert_eq!((first.number, second.number), (1, 2));
        assert_eq!(RepoStore::find(store.as_ref(), 1).await.unwrap().pull_req_seq, 2);

        let records = stream.records();
        assert_eq!(records.len(), 2);
        let payload: PullReqCreatedPayload = records[1].payload().unwrap();
        assert_eq!((payload.pullreq_id, payload.number, payload.principal_id), (second.id, 2, 7));
    }

    #[tokio::test]
    async fn only_one_open_pull_request_per_branch_pair() {
        let (store, _stream, service) = setup();
        service.create(7, new_pr("feat/a")).await.unwrap();
        assert!(matches!(service.create(7, new_pr("feat/a")).await, Err(Error::Conflict(_))));
        assert_eq!(RepoStore::find(store.as_ref(), 1).await.unwrap().pull_req_seq, 1);

        let mut other_target = new_pr("feat/a");
        other_target.target_branch = "release".into();
        assert_eq!(service.create(7, other_target).await.unwrap().number, 2);
    }

    #[tokio::test]
    async fn follower_moves_open_sources_once() {
        let (store, stream, service) = setup();
        let pr = service.create(7, new_pr("feat/a")).await.unwrap();
        let follower = SourceBranchFollower::new(store.clone(), Reporter::new(stream.clone(), "test", 3));

        let record = Record::new(
            EventKind::BranchUpdated,
            "test",
            &RefUpdatedPayload {
                repo_id: 1,
                principal_id: 9,
                ref_name: "refs/heads/feat/a".into(),
                old_sha: "a".repeat(40),
                new_sha: "c".repeat(40),
                forced: true,
            },
        )
        .unwrap();
        follower.handle(&record).await.unwrap();
        follower.handle(&record).await.unwrap();

        assert_eq!(PullReqStore::find(store.as_ref(), pr.id).await.unwrap().source_sha, "c".repeat(40));
        let moved: Vec<PullReqBranchUpdatedPayload> = stream
            .read_from(0, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|(_, r)| r.kind() == EventKind::PullReqBranchUpdated)
            .map(|(_, r)| r.payload().unwrap())
            .collect();
        assert_eq!(moved.len(), 1);
        assert!(moved[0].forced);
        assert_eq!(moved[0].old_sha, "a".repeat(40));
    }
}
