//! Contracts of the persistent stores the pipeline reads and writes.
//!
//! The stores themselves live outside this crate; only their behaviour matters here.
//! [`memory::MemoryStore`] implements every contract in memory for tests and single-node setups.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Error;

pub mod memory;

/// Lifecycle state of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoState {
    Active,
    Importing,
    /// A migration is pushing history, including server-managed refs.
    MigrateGitPush,
    Archived,
}

/// A repository as far as push admission is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub parent_id: i64,
    pub identifier: String,
    /// `space/identifier`, used to resolve requests and build URLs.
    pub path: String,
    /// Names the on-disk directory; never changes after creation.
    pub git_uid: String,
    pub state: RepoState,
    pub default_branch: String,
    pub is_empty: bool,
    pub pull_req_seq: i64,
    pub mirror: bool,
    pub is_public: bool,
    pub require_fit_client: bool,
    /// Size on disk in bytes, maintained by a background job.
    pub size: i64,
    /// Incremented on every update, used for optimistic locking.
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Service,
    ServiceAccount,
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub uid: String,
    pub email: String,
    pub display_name: String,
    pub kind: PrincipalKind,
}

/// Whether a protection rule is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Active,
    /// Violations are reported but never block.
    Monitor,
    Disabled,
}

/// A stored protection rule, with its pattern and definition kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionRule {
    pub id: i64,
    pub repo_id: i64,
    pub identifier: String,
    /// The rule kind, selecting the definition parser.
    pub kind: String,
    pub state: RuleState,
    pub pattern: serde_json::Value,
    pub definition: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullReqState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeCheckStatus {
    #[default]
    Unchecked,
    Mergeable,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReq {
    pub id: i64,
    pub version: i64,
    /// Unique per target repository, taken from [`Repository::pull_req_seq`].
    pub number: i64,
    pub created_by: i64,
    /// Unix epoch milliseconds.
    pub created: i64,
    pub title: String,
    pub state: PullReqState,
    pub source_repo_id: i64,
    pub source_branch: String,
    pub source_sha: String,
    pub target_repo_id: i64,
    pub target_branch: String,
    pub merge_base_sha: String,
    pub merge_check_status: MergeCheckStatus,
}

/// Selects pull requests; `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReqFilter {
    pub source_repo_id: Option<i64>,
    pub source_branch: Option<String>,
    pub target_repo_id: Option<i64>,
    pub target_branch: Option<String>,
    /// Empty means all states.
    pub states: Vec<PullReqState>,
    /// Zero means unlimited.
    pub limit: usize,
}

impl PullReqFilter {
    /// Open pull requests whose source is `branch` of `repo_id`.
    pub fn open_from(repo_id: i64, branch: &str) -> Self {
        PullReqFilter {
            source_repo_id: Some(repo_id),
            source_branch: Some(branch.to_owned()),
            states: vec![PullReqState::Open],
            ..Default::default()
        }
    }

    pub fn matches(&self, pr: &PullReq) -> bool {
        self.source_repo_id.map_or(true, |id| id == pr.source_repo_id)
            && self.source_branch.as_deref().map_or(true, |b| b == pr.source_branch)
            && self.target_repo_id.map_or(true, |id| id == pr.target_repo_id)
            && self.target_branch.as_deref().map_or(true, |b| b == pr.target_branch)
            && (self.states.is_empty() || self.states.contains(&pr.state))
    }
}

/// What a principal wants to do with a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Push,
    /// Repository ownership, which qualifies for rule bypass.
    Own,
}

/// Keys of per-repository settings.
pub mod settings {
    pub const SECRET_SCANNING_ENABLED: &str = "secret_scanning_enabled";
    pub const FILE_SIZE_LIMIT: &str = "file_size_limit";
    pub const AI_REVIEW_ENABLED: &str = "ai_review_enabled";
    pub const CODEOWNERS_ENABLED: &str = "codeowners_enabled";
}

#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn find(&self, id: i64) -> Result<Repository, Error>;
    /// Resolve a repository by its `space/identifier` path.
    async fn find_by_ref(&self, path: &str) -> Result<Repository, Error>;
    /// Persist `repo` if its `version` is still current and return it with the version bumped.
    ///
    /// Fails with [`Error::VersionConflict`] if someone else updated it in the meantime.
    async fn update(&self, repo: &Repository) -> Result<Repository, Error>;
    async fn count_in_space(&self, space_id: i64) -> Result<i64, Error>;
}

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn find(&self, id: i64) -> Result<Principal, Error>;
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, Error>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules of a repository in stored order.
    async fn list_for_repo(&self, repo_id: i64) -> Result<Vec<ProtectionRule>, Error>;
}

#[async_trait]
pub trait PullReqStore: Send + Sync {
    async fn find(&self, id: i64) -> Result<PullReq, Error>;
    /// Matching pull requests ordered by number.
    async fn list(&self, filter: &PullReqFilter) -> Result<Vec<PullReq>, Error>;
    async fn count(&self, filter: &PullReqFilter) -> Result<usize, Error>;
    /// Store a new pull request, assigning its id.
    ///
    /// Fails with [`Error::Conflict`] if an open one exists for the same source and target.
    async fn create(&self, pr: &PullReq) -> Result<PullReq, Error>;
    /// Version-checked update like [`RepoStore::update`].
    async fn update(&self, pr: &PullReq) -> Result<PullReq, Error>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn repo_get(&self, repo_id: i64, key: &str) -> Result<Option<serde_json::Value>, Error>;
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn permitted(&self, principal: &Principal, repo: &Repository, permission: Permission) -> Result<bool, Error>;
}

/// Read a boolean repository setting, falling back to `default` when unset or of another type.
pub async fn repo_bool(settings: &dyn SettingsStore, repo_id: i64, key: &str, default: bool) -> Result<bool, Error> {
    Ok(settings
        .repo_get(repo_id, key)
        .await?
        .and_then(|v| v.as_bool())
        .unwrap_or(default))
}

/// Read an integer repository setting, falling back to `default` when unset or of another type.
pub async fn repo_i64(settings: &dyn SettingsStore, repo_id: i64, key: &str, default: i64) -> Result<i64, Error> {
    Ok(settings
        .repo_get(repo_id, key)
        .await?
        .and_then(|v| v.as_i64())
        .unwrap_or(default))
}

const OPT_LOCK_ATTEMPTS: u32 = 5;

/// Apply `mutate` to `repo` and persist it, re-reading and re-applying on version conflicts.
///
/// If `mutate` leaves the repository unchanged nothing is written, which makes repeated
/// application of an idempotent mutation a no-op.
pub async fn update_opt_lock<F>(store: &dyn RepoStore, repo: Repository, mut mutate: F) -> Result<Repository, Error>
where
    F: FnMut(&mut Repository) -> Result<(), Error> + Send,
{
    let mut current = repo;
    for attempt in 1..=OPT_LOCK_ATTEMPTS {
        let mut next = current.clone();
        mutate(&mut next)?;
        if next == current {
            return Ok(current);
        }
        match store.update(&next).await {
            Ok(updated) => return Ok(updated),
            Err(Error::VersionConflict(what)) => {
                tracing::debug!(repo_id = current.id, attempt, "version conflict on {what}, re-reading");
                current = store.find(current.id).await?;
            }
            Err(err) => return Err(err),
        }
    }
    Err(Error::VersionConflict(format!("repository {}", current.id)))
}

/// The collaborators the pipeline reads from, shared across requests.
#[derive(Clone)]
pub struct Stores {
    pub repos: Arc<dyn RepoStore>,
    pub principals: Arc<dyn PrincipalStore>,
    pub rules: Arc<dyn RuleStore>,
    pub pullreqs: Arc<dyn PullReqStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub authz: Arc<dyn Authorizer>,
}

impl Stores {
    /// Back every contract with the same in-memory store.
    pub fn memory(store: Arc<memory::MemoryStore>) -> Self {
        Stores {
            repos: store.clone(),
            principals: store.clone(),
            rules: store.clone(),
            pullreqs: store.clone(),
            settings: store.clone(),
            authz: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
