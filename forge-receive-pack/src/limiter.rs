//! Quotas checked before a push is admitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::LimitsConfig;
use crate::store::RepoStore;
use crate::Error;

/// Per-repository and per-space resource quotas.
#[async_trait]
pub trait ResourceLimiter: Send + Sync {
    /// Fail with [`Error::LimitExceeded`] if the repository is larger than allowed.
    async fn check_repo_size(&self, repo_id: i64) -> Result<(), Error>;

    /// Fail with [`Error::LimitExceeded`] if the space cannot hold another repository.
    async fn check_repo_count(&self, space_id: i64) -> Result<(), Error>;
}

/// Lets everything pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedLimiter;

#[async_trait]
impl ResourceLimiter for UnlimitedLimiter {
    async fn check_repo_size(&self, _repo_id: i64) -> Result<(), Error> {
        Ok(())
    }

    async fn check_repo_count(&self, _space_id: i64) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedSize {
    size: i64,
    fetched: Instant,
    refreshing: bool,
}

/// Enforces [`LimitsConfig`] with repository sizes cached for `size_cache_ttl`.
///
/// A stale size is still used for the decision while a background task fetches a fresh one,
/// so only the very first push to a repository waits for the store.
#[derive(Clone)]
pub struct QuotaLimiter {
    repos: Arc<dyn RepoStore>,
    limits: LimitsConfig,
    sizes: Arc<Mutex<HashMap<i64, CachedSize>>>,
}

impl QuotaLimiter {
    pub fn new(repos: Arc<dyn RepoStore>, limits: LimitsConfig) -> Self {
        QuotaLimiter {
            repos,
            limits,
            sizes: Arc::default(),
        }
    }

    async fn repo_size(&self, repo_id: i64) -> Result<i64, Error> {
        let cached = {
            let mut sizes = self.sizes.lock().unwrap_or_else(PoisonError::into_inner);
            match sizes.get_mut(&repo_id) {
                Some(entry) => {
                    let stale = entry.fetched.elapsed() >= self.limits.size_cache_ttl;
                    let spawn_refresh = stale && !entry.refreshing;
                    if spawn_refresh {
                        entry.refreshing = true;
                    }
                    Some((entry.size, spawn_refresh))
                }
                None => None,
            }
        };
        match cached {
            Some((size, spawn_refresh)) => {
                if spawn_refresh {
                    self.spawn_refresh(repo_id);
                }
                Ok(size)
            }
            None => {
                let size = self.repos.find(repo_id).await?.size;
                self.store(repo_id, size);
                Ok(size)
            }
        }
    }

    fn spawn_refresh(&self, repo_id: i64) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.repos.find(repo_id).await {
                Ok(repo) => this.store(repo_id, repo.size),
                Err(err) => {
                    tracing::warn!(repo_id, error = %err, "failed to refresh repository size");
                    if let Some(entry) = this.sizes.lock().unwrap_or_else(PoisonError::into_inner).get_mut(&repo_id) {
                        entry.refreshing = false;
                    }
                }
            }
        });
    }

    fn store(&self, repo_id: i64, size: i64) {
        self.sizes.lock().unwrap_or_else(PoisonError::into_inner).insert(
            repo_id,
            CachedSize {
                size,
                fetched: Instant::now(),
                refreshing: false,
            },
        );
    }

    pub fn cache_ttl(&self) -> Duration {
        self.limits.size_cache_ttl
    }
}

#[async_trait]
impl ResourceLimiter for QuotaLimiter {
    async fn check_repo_size(&self, repo_id: i64) -> Result<(), Error> {
        if self.limits.max_repo_size == 0 {
            return Ok(());
        }
        let size = self.repo_size(repo_id).await?;
        if size > self.limits.max_repo_size as i64 {
            return Err(Error::LimitExceeded(format!(
                "repository {repo_id} has {size} bytes, the limit is {}",
                self.limits.max_repo_size
            )));
        }
        Ok(())
    }

    async fn check_repo_count(&self, space_id: i64) -> Result<(), Error> {
        if self.limits.max_repos_per_space == 0 {
            return Ok(());
        }
        let count = self.repos.count_in_space(space_id).await?;
        if count >= self.limits.max_repos_per_space as i64 {
            return Err(Error::LimitExceeded(format!(
                "space {space_id} has {count} repositories, the limit is {}",
                self.limits.max_repos_per_space
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLimiter").field("limits", &self.limits).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{RepoState, Repository};

    fn repo(id: i64, size: i64) -> Repository {
        Repository {
            id,
            parent_id: 10,
            identifier: format!("r{id}"),
            path: format!("space/r{id}"),
            git_uid: format!("uid{id}"),
            state: RepoState::Active,
            default_branch: "main".into(),
            is_empty: false,
            pull_req_seq: 0,
            mirror: false,
            is_public: false,
            require_fit_client: false,
            size,
            version: 1,
        }
    }

    fn limits(max_repo_size: u64, max_repos_per_space: u64) -> LimitsConfig {
        LimitsConfig {
            max_repo_size,
            max_repos_per_space,
            size_cache_ttl: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn size_limit() {
        let store = Arc::new(MemoryStore::new());
        store.insert_repo(repo(1, 100)).unwrap();
        store.insert_repo(repo(2, 2000)).unwrap();
        let limiter = QuotaLimiter::new(store, limits(1000, 0));
        limiter.check_repo_size(1).await.unwrap();
        assert!(matches!(limiter.check_repo_size(2).await, Err(Error::LimitExceeded(_))));
        assert!(matches!(limiter.check_repo_size(3).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn count_limit() {
        let store = Arc::new(MemoryStore::new());
        store.insert_repo(repo(1, 0)).unwrap();
        let limiter = QuotaLimiter::new(store.clone(), limits(0, 2));
        limiter.check_repo_count(10).await.unwrap();
        store.insert_repo(repo(2, 0)).unwrap();
        assert!(matches!(limiter.check_repo_count(10).await, Err(Error::LimitExceeded(_))));
        limiter.check_repo_count(11).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sizes_are_served_while_refreshing() {
        let store = Arc::new(MemoryStore::new());
        store.insert_repo(repo(1, 100)).unwrap();
        let limiter = QuotaLimiter::new(store.clone(), limits(1000, 0));
        limiter.check_repo_size(1).await.unwrap();

        store.insert_repo(repo(1, 5000)).unwrap();
        limiter.check_repo_size(1).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        // stale: still passes on the cached size and triggers the refresh
        limiter.check_repo_size(1).await.unwrap();
        tokio::task::yield_now().await;
        assert!(matches!(limiter.check_repo_size(1).await, Err(Error::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn unlimited() {
        UnlimitedLimiter.check_repo_size(1).await.unwrap();
        UnlimitedLimiter.check_repo_count(1).await.unwrap();
    }
}
