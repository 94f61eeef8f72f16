//! CODEOWNERS enforcement for direct pushes.
//!
//! The CODEOWNERS file is read from the tip a branch had before the push, so a push cannot
//! make its author an owner of what it changes. Each changed path is assigned to the last entry
//! matching it; every assigned entry must list the pusher.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::git::{GitReader, ReadParams};
use crate::refs::RefUpdate;
use crate::store::PrincipalStore;
use crate::Error;

mod parse;

pub use parse::{parse, Entry, ParseError};

/// Owners starting with this marker name groups, which are not resolved.
const GROUP_MARKER: char = '@';

/// The default locations of the CODEOWNERS file, in lookup order.
pub const DEFAULT_PATHS: [&str; 3] = ["CODEOWNERS", ".github/CODEOWNERS", "docs/CODEOWNERS"];

/// What the guard found for a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Entries whose owners do not include the pusher, in file order.
    pub denied: Vec<Entry>,
    /// Problems with CODEOWNERS files that made the guard skip a ref.
    pub warnings: Vec<String>,
}

impl Evaluation {
    pub fn denied_patterns(&self) -> Vec<String> {
        self.denied.iter().map(|e| e.pattern.clone()).collect()
    }
}

#[derive(Clone)]
pub struct CodeOwnersGuard {
    git: Arc<dyn GitReader>,
    principals: Arc<dyn PrincipalStore>,
    paths: Vec<String>,
}

impl CodeOwnersGuard {
    pub fn new(git: Arc<dyn GitReader>, principals: Arc<dyn PrincipalStore>, paths: Vec<String>) -> Self {
        CodeOwnersGuard { git, principals, paths }
    }

    /// Check the branch `updates` of a push by `principal_id`.
    pub async fn evaluate(&self, params: &ReadParams, principal_id: i64, updates: &[RefUpdate]) -> Result<Evaluation, Error> {
        let mut eval = Evaluation::default();
        let mut denied: BTreeMap<usize, Entry> = BTreeMap::new();
        for update in updates.iter().filter(|u| !u.is_create() && !u.is_delete()) {
            let Some(text) = self.read(params, update).await? else {
                continue;
            };
            let entries = match parse(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(ref_name = %update.name, line = err.line_number, "invalid CODEOWNERS file");
                    eval.warnings.push(err.to_string());
                    continue;
                }
            };
            let changed = self.git.diff_file_names(params, update.old, update.new).await?;
            for entry in applicable(&entries, &changed) {
                if denied.contains_key(&entry.line_number) {
                    continue;
                }
                if !self.is_owner(principal_id, entry).await? {
                    denied.insert(entry.line_number, entry.clone());
                }
            }
        }
        eval.denied = denied.into_values().collect();
        Ok(eval)
    }

    async fn read(&self, params: &ReadParams, update: &RefUpdate) -> Result<Option<String>, Error> {
        for path in &self.paths {
            if let Some(bytes) = self.git.read_file(params, update.old, path).await? {
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }
        }
        Ok(None)
    }

    async fn is_owner(&self, principal_id: i64, entry: &Entry) -> Result<bool, Error> {
        for owner in &entry.owners {
            if owner.starts_with(GROUP_MARKER) {
                continue;
            }
            match self.principals.find_by_email(owner).await? {
                Some(principal) if principal.id == principal_id => return Ok(true),
                Some(_) => {}
                None => tracing::debug!(owner = %owner, "code owner is not a known user"),
            }
        }
        Ok(false)
    }
}

/// The entries owning at least one of `changed`, without ownership resets, in file order.
fn applicable<'a>(entries: &'a [Entry], changed: &[String]) -> Vec<&'a Entry> {
    let mut picked: BTreeMap<usize, &Entry> = BTreeMap::new();
    for path in changed {
        if let Some(entry) = entries.iter().rev().find(|e| e.matches(path)) {
            picked.insert(entry.line_number, entry);
        }
    }
    picked.into_values().filter(|e| !e.is_ownership_reset()).collect()
}

impl std::fmt::Debug for CodeOwnersGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeOwnersGuard").field("paths", &self.paths).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_match_wins_and_resets_drop_out() {
        let entries = parse("* all@example.com\n/src/ rust@example.com\n/src/vendor/\n").unwrap();
        let changed = vec!["README.md".to_owned(), "src/lib.rs".to_owned(), "src/vendor/x.rs".to_owned()];
        let picked: Vec<usize> = applicable(&entries, &changed).iter().map(|e| e.line_number).collect();
        assert_eq!(picked, vec![1, 2]);
    }

    #[test]
    fn unmatched_paths_need_no_owner() {
        let entries = parse("/docs/ docs@example.com\n").unwrap();
        assert!(applicable(&entries, &["src/main.rs".to_owned()]).is_empty());
    }
}
