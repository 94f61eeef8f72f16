//! Fixtures shared by the integration tests: a scripted [`GitReader`] and a harness that
//! drives the controller through the hooks of a push.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forge_receive_pack::controller::{Controller, Parts};
use forge_receive_pack::events::{EventKind, MemoryStream, Record, Reporter};
use forge_receive_pack::git::{AddedLine, FilePatch, GitReader, ObjectInfo, ReadParams};
use forge_receive_pack::hooks::{Environment, HookHandler, HookInput, HookOutput};
use forge_receive_pack::refs::{null_id, RefUpdate};
use forge_receive_pack::session::PushSession;
use forge_receive_pack::store::memory::MemoryStore;
use forge_receive_pack::store::{Permission, Principal, PrincipalKind, RepoState, Repository, Stores};
use forge_receive_pack::Error;
use gix_hash::ObjectId;
use tokio_util::sync::CancellationToken;

pub const REPO_ID: i64 = 7;
pub const OWNER: i64 = 1;
pub const DEVELOPER: i64 = 2;

pub fn id(n: u8) -> ObjectId {
    ObjectId::from_bytes_or_panic(&[n; 20])
}

pub fn zero() -> ObjectId {
    null_id()
}

pub fn update(name: &str, old: ObjectId, new: ObjectId) -> RefUpdate {
    RefUpdate::new(name, old, new).unwrap()
}

pub fn repo() -> Repository {
    Repository {
        id: REPO_ID,
        parent_id: 3,
        identifier: "app".into(),
        path: "team/app".into(),
        git_uid: "c0ffee".into(),
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

pub fn principal(id: i64) -> Principal {
    Principal {
        id,
        uid: format!("user{id}"),
        email: format!("user{id}@example.com"),
        display_name: format!("User {id}"),
        kind: PrincipalKind::User,
    }
}

/// A [`GitReader`] answering from scripted tables.
///
/// Unscripted ancestry probes answer "fast-forward"; everything else is empty.
#[derive(Debug, Default)]
pub struct FakeGit {
    not_ancestors: Mutex<HashSet<(ObjectId, ObjectId)>>,
    failing_probes: Mutex<HashSet<(ObjectId, ObjectId)>>,
    commits: Mutex<HashMap<ObjectId, Vec<ObjectId>>>,
    patches: Mutex<HashMap<ObjectId, Vec<FilePatch>>>,
    objects: Mutex<Vec<ObjectInfo>>,
    files: Mutex<HashMap<(ObjectId, String), Vec<u8>>>,
    diffs: Mutex<HashMap<(ObjectId, ObjectId), Vec<String>>>,
}

impl FakeGit {
    /// Make `old -> new` a non-fast-forward.
    pub fn diverge(&self, old: ObjectId, new: ObjectId) {
        self.not_ancestors.lock().unwrap().insert((old, new));
    }

    /// Make the ancestry probe for `old -> new` fail.
    pub fn break_probe(&self, old: ObjectId, new: ObjectId) {
        self.failing_probes.lock().unwrap().insert((old, new));
    }

    /// Let `tip` bring `commit`, which adds `lines` to `path`.
    pub fn add_commit(&self, tip: ObjectId, commit: ObjectId, path: &str, lines: &[&str]) {
        self.commits.lock().unwrap().entry(tip).or_default().push(commit);
        let added = lines
            .iter()
            .enumerate()
            .map(|(i, text)| AddedLine {
                number: i as u32 + 1,
                text: (*text).to_owned(),
            })
            .collect();
        self.patches.lock().unwrap().entry(commit).or_default().push(FilePatch {
            path: path.to_owned(),
            added,
        });
    }

    pub fn add_object(&self, info: ObjectInfo) {
        self.objects.lock().unwrap().push(info);
    }

    pub fn add_file(&self, rev: ObjectId, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert((rev, path.to_owned()), content.as_bytes().to_vec());
    }

    pub fn set_diff(&self, old: ObjectId, new: ObjectId, paths: &[&str]) {
        self.diffs
            .lock()
            .unwrap()
            .insert((old, new), paths.iter().map(|p| (*p).to_owned()).collect());
    }
}

#[async_trait]
impl GitReader for FakeGit {
    async fn is_ancestor(&self, _params: &ReadParams, ancestor: ObjectId, descendant: ObjectId) -> Result<bool, Error> {
        if self.failing_probes.lock().unwrap().contains(&(ancestor, descendant)) {
            return Err(Error::Git {
                command: "merge-base".into(),
                status: "exit status: 128".into(),
                stderr: "fatal: bad object".into(),
            });
        }
        Ok(!self.not_ancestors.lock().unwrap().contains(&(ancestor, descendant)))
    }

    async fn new_commits(&self, _params: &ReadParams, tips: &[ObjectId]) -> Result<Vec<ObjectId>, Error> {
        let commits = self.commits.lock().unwrap();
        Ok(tips.iter().flat_map(|t| commits.get(t).cloned().unwrap_or_default()).collect())
    }

    async fn added_lines(&self, _params: &ReadParams, commit: ObjectId) -> Result<Vec<FilePatch>, Error> {
        Ok(self.patches.lock().unwrap().get(&commit).cloned().unwrap_or_default())
    }

    async fn list_objects(&self, _params: &ReadParams, _object_dir: &Path) -> Result<Vec<ObjectInfo>, Error> {
        Ok(self.objects.lock().unwrap().clone())
    }

    async fn read_file(&self, _params: &ReadParams, rev: ObjectId, path: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.files.lock().unwrap().get(&(rev, path.to_owned())).cloned())
    }

    async fn diff_file_names(&self, _params: &ReadParams, old: ObjectId, new: ObjectId) -> Result<Vec<String>, Error> {
        Ok(self.diffs.lock().unwrap().get(&(old, new)).cloned().unwrap_or_default())
    }
}

/// The outcome of driving one push through the hooks.
#[derive(Debug)]
pub struct Pushed {
    pub pre: Result<HookOutput, Error>,
    /// Only set if pre-receive accepted the push.
    pub post: Option<HookOutput>,
}

impl Pushed {
    pub fn accepted(&self) -> bool {
        self.pre.as_ref().is_ok_and(|out| !out.is_rejected())
    }

    pub fn pre_output(&self) -> &HookOutput {
        self.pre.as_ref().expect("pre-receive failed")
    }

    pub fn post_output(&self) -> &HookOutput {
        self.post.as_ref().expect("push was not accepted")
    }
}

/// A controller over a memory store with one repository, its owner and a developer.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub git: Arc<FakeGit>,
    pub stream: Arc<MemoryStream>,
    pub controller: Controller,
}

impl Harness {
    pub fn new(repo: Repository) -> Self {
        Self::with_parts(repo, |_| {})
    }

    /// Like [`Harness::new`], letting `adjust` change the parts before the controller is built.
    pub fn with_parts(repo: Repository, adjust: impl FnOnce(&mut Parts)) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_repo(repo.clone()).unwrap();
        store.insert_principal(principal(OWNER)).unwrap();
        store.insert_principal(principal(DEVELOPER)).unwrap();
        store.grant(OWNER, repo.id, Permission::Own).unwrap();
        store.grant(DEVELOPER, repo.id, Permission::Push).unwrap();

        let git = Arc::new(FakeGit::default());
        let stream = Arc::new(MemoryStream::new());
        let reporter = Reporter::new(stream.clone(), "test", 3);
        let mut parts = Parts::new(Stores::memory(store.clone()), git.clone(), reporter).unwrap();
        parts.server.base_url = "https://forge.example.com".into();
        adjust(&mut parts);
        Harness {
            store,
            git,
            stream,
            controller: Controller::new(parts),
        }
    }

    pub fn input(&self, principal_id: i64, updates: Vec<RefUpdate>) -> HookInput {
        HookInput {
            repo_id: REPO_ID,
            principal_id,
            internal: false,
            ref_updates: updates,
            environment: Environment::default(),
        }
    }

    /// Run pre-receive, then update per ref and post-receive if the push was accepted.
    pub async fn push(&self, input: HookInput) -> Pushed {
        let session = PushSession::new(input.repo_id, input.principal_id, input.internal, CancellationToken::new());
        let pre = self.controller.pre_receive(&session, &input).await;
        if !pre.as_ref().is_ok_and(|out| !out.is_rejected()) {
            return Pushed { pre, post: None };
        }
        for update in &input.ref_updates {
            let single = HookInput {
                ref_updates: vec![update.clone()],
                ..input.clone()
            };
            let out = self.controller.update(&session, &single).await.unwrap();
            assert!(!out.is_rejected(), "update hook rejected {}", update.name);
        }
        let post = self.controller.post_receive(&session, &input).await.unwrap();
        Pushed { pre, post: Some(post) }
    }

    pub fn events(&self) -> Vec<Record> {
        self.stream.records()
    }

    pub fn event_kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(Record::kind).collect()
    }

    pub async fn repo(&self) -> Repository {
        use forge_receive_pack::store::RepoStore;
        self.store.find(REPO_ID).await.unwrap()
    }
}
