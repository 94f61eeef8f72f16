//! Everything that talks to the local `git` binary.
//!
//! [`GitReader`] is the read-only view the guards and the classifier use while a push is
//! pending, [`invoker::GitInvoker`] spawns the `--stateless-rpc` services for the smart protocol.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gix_hash::ObjectId;

use crate::Error;

pub mod cli;
pub mod invoker;

pub use cli::GitCli;

/// Where to read objects from: the repository plus the object directories of a pending push.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadParams {
    pub repo_dir: PathBuf,
    /// Passed as `GIT_ALTERNATE_OBJECT_DIRECTORIES` so objects of the pending push are visible.
    pub alternate_object_dirs: Vec<PathBuf>,
}

impl ReadParams {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        ReadParams {
            repo_dir: repo_dir.into(),
            alternate_object_dirs: Vec::new(),
        }
    }

    pub fn with_alternates(mut self, dirs: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.alternate_object_dirs.extend(dirs.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl std::str::FromStr for ObjectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "blob" => ObjectKind::Blob,
            "tree" => ObjectKind::Tree,
            "commit" => ObjectKind::Commit,
            "tag" => ObjectKind::Tag,
            other => return Err(Error::Protocol(format!("unknown object type {other:?}"))),
        })
    }
}

/// One entry of an object directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub size: u64,
}

/// A line added by a commit, with its 1-based number in the new file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedLine {
    pub number: u32,
    pub text: String,
}

/// The lines a commit adds to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub path: String,
    pub added: Vec<AddedLine>,
}

/// Read access to a repository during a push.
#[async_trait]
pub trait GitReader: Send + Sync {
    /// True if `ancestor` is reachable from `descendant`.
    async fn is_ancestor(&self, params: &ReadParams, ancestor: ObjectId, descendant: ObjectId) -> Result<bool, Error>;

    /// Commits reachable from `tips` but from none of the repository's refs, oldest last.
    async fn new_commits(&self, params: &ReadParams, tips: &[ObjectId]) -> Result<Vec<ObjectId>, Error>;

    /// The lines `commit` adds compared to its first parent, or to the empty tree for root commits.
    async fn added_lines(&self, params: &ReadParams, commit: ObjectId) -> Result<Vec<FilePatch>, Error>;

    /// All objects stored in `object_dir` itself, ignoring any alternates.
    async fn list_objects(&self, params: &ReadParams, object_dir: &Path) -> Result<Vec<ObjectInfo>, Error>;

    /// The blob at `path` in the tree of `rev`, or `None` if there is no such file.
    async fn read_file(&self, params: &ReadParams, rev: ObjectId, path: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Paths that differ between the trees of `old` and `new`.
    async fn diff_file_names(&self, params: &ReadParams, old: ObjectId, new: ObjectId) -> Result<Vec<String>, Error>;
}

/// Prepare an invocation of `git` in `dir` with alternates applied, leaving arguments to the caller.
pub(crate) fn prepare(binary: &OsStr, params: &ReadParams) -> Result<gix_command::Prepare, Error> {
    let mut prepare = gix_command::prepare(binary).env("GIT_DIR", &params.repo_dir);
    if !params.alternate_object_dirs.is_empty() {
        let joined = std::env::join_paths(&params.alternate_object_dirs)
            .map_err(|e| Error::Bug(format!("unusable alternate object directory: {e}")))?;
        prepare = prepare.env("GIT_ALTERNATE_OBJECT_DIRECTORIES", joined);
    }
    Ok(prepare)
}
