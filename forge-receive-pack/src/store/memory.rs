use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    Authorizer, Permission, Principal, PrincipalStore, ProtectionRule, PullReq, PullReqFilter, PullReqState,
    PullReqStore, RepoStore, Repository, RuleStore, SettingsStore,
};
use crate::Error;

#[derive(Debug, Default)]
struct State {
    repos: HashMap<i64, Repository>,
    principals: HashMap<i64, Principal>,
    rules: Vec<ProtectionRule>,
    pullreqs: Vec<PullReq>,
    settings: HashMap<(i64, String), serde_json::Value>,
    grants: HashSet<(i64, i64, Permission)>,
    next_pullreq_id: i64,
}

/// All store contracts backed by one mutex-guarded map set.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::Bug("memory store mutex poisoned".into()))
    }

    pub fn insert_repo(&self, repo: Repository) -> Result<(), Error> {
        self.lock()?.repos.insert(repo.id, repo);
        Ok(())
    }

    pub fn insert_principal(&self, principal: Principal) -> Result<(), Error> {
        self.lock()?.principals.insert(principal.id, principal);
        Ok(())
    }

    /// Append a rule, which places it last in stored order.
    pub fn insert_rule(&self, rule: ProtectionRule) -> Result<(), Error> {
        self.lock()?.rules.push(rule);
        Ok(())
    }

    pub fn set_setting(&self, repo_id: i64, key: &str, value: serde_json::Value) -> Result<(), Error> {
        self.lock()?.settings.insert((repo_id, key.to_owned()), value);
        Ok(())
    }

    /// Grant `permission`; [`Permission::Own`] implies the others.
    pub fn grant(&self, principal_id: i64, repo_id: i64, permission: Permission) -> Result<(), Error> {
        self.lock()?.grants.insert((principal_id, repo_id, permission));
        Ok(())
    }
}

#[async_trait]
impl RepoStore for MemoryStore {
    async fn find(&self, id: i64) -> Result<Repository, Error> {
        self.lock()?
            .repos
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {id}")))
    }

    async fn find_by_ref(&self, path: &str) -> Result<Repository, Error> {
        self.lock()?
            .repos
            .values()
            .find(|r| r.path == path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {path:?}")))
    }

    async fn update(&self, repo: &Repository) -> Result<Repository, Error> {
        let mut state = self.lock()?;
        let stored = state
            .repos
            .get_mut(&repo.id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repo.id)))?;
        if stored.version != repo.version {
            return Err(Error::VersionConflict(format!("repository {}", repo.id)));
        }
        let mut updated = repo.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn count_in_space(&self, space_id: i64) -> Result<i64, Error> {
        Ok(self.lock()?.repos.values().filter(|r| r.parent_id == space_id).count() as i64)
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn find(&self, id: i64) -> Result<Principal, Error> {
        self.lock()?
            .principals
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("principal {id}")))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, Error> {
        Ok(self
            .lock()?
            .principals
            .values()
            .find(|p| p.email.eq_ignore_ascii_case(email))
            .cloned())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn list_for_repo(&self, repo_id: i64) -> Result<Vec<ProtectionRule>, Error> {
        Ok(self
            .lock()?
            .rules
            .iter()
            .filter(|r| r.repo_id == repo_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PullReqStore for MemoryStore {
    async fn find(&self, id: i64) -> Result<PullReq, Error> {
        self.lock()?
            .pullreqs
            .iter()
            .find(|pr| pr.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pull request {id}")))
    }

    async fn list(&self, filter: &PullReqFilter) -> Result<Vec<PullReq>, Error> {
        let state = self.lock()?;
        let mut prs: Vec<_> = state.pullreqs.iter().filter(|pr| filter.matches(pr)).cloned().collect();
        prs.sort_by_key(|pr| (pr.target_repo_id, pr.number));
        if filter.limit > 0 {
            prs.truncate(filter.limit);
        }
        Ok(prs)
    }

    async fn count(&self, filter: &PullReqFilter) -> Result<usize, Error> {
        Ok(self.lock()?.pullreqs.iter().filter(|pr| filter.matches(pr)).count())
    }

    async fn create(&self, pr: &PullReq) -> Result<PullReq, Error> {
        let mut state = self.lock()?;
        if pr.state == PullReqState::Open && state.pullreqs.iter().any(|other| same_open_tuple(other, pr)) {
            return Err(Error::Conflict(format!(
                "an open pull request from {:?} into {:?} already exists",
                pr.source_branch, pr.target_branch
            )));
        }
        state.next_pullreq_id += 1;
        let mut created = pr.clone();
        created.id = state.next_pullreq_id;
        created.version = 1;
        state.pullreqs.push(created.clone());
        Ok(created)
    }

    async fn update(&self, pr: &PullReq) -> Result<PullReq, Error> {
        let mut state = self.lock()?;
        if pr.state == PullReqState::Open
            && state
                .pullreqs
                .iter()
                .any(|other| other.id != pr.id && same_open_tuple(other, pr))
        {
            return Err(Error::Conflict(format!("pull request {} would duplicate an open one", pr.number)));
        }
        let stored = state
            .pullreqs
            .iter_mut()
            .find(|p| p.id == pr.id)
            .ok_or_else(|| Error::NotFound(format!("pull request {}", pr.id)))?;
        if stored.version != pr.version {
            return Err(Error::VersionConflict(format!("pull request {}", pr.id)));
        }
        let mut updated = pr.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }
}

fn same_open_tuple(a: &PullReq, b: &PullReq) -> bool {
    a.state == PullReqState::Open
        && a.source_repo_id == b.source_repo_id
        && a.source_branch == b.source_branch
        && a.target_repo_id == b.target_repo_id
        && a.target_branch == b.target_branch
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn repo_get(&self, repo_id: i64, key: &str) -> Result<Option<serde_json::Value>, Error> {
        Ok(self.lock()?.settings.get(&(repo_id, key.to_owned())).cloned())
    }
}

#[async_trait]
impl Authorizer for MemoryStore {
    async fn permitted(&self, principal: &Principal, repo: &Repository, permission: Permission) -> Result<bool, Error> {
        let state = self.lock()?;
        let has = |p| state.grants.contains(&(principal.id, repo.id, p));
        Ok(match permission {
            Permission::Own => has(Permission::Own),
            Permission::Push => has(Permission::Own) || has(Permission::Push),
            Permission::Read => repo.is_public || has(Permission::Own) || has(Permission::Push) || has(Permission::Read),
        })
    }
}
