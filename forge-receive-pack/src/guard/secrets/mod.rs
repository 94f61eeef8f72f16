//! Secret detection over the lines a push adds.

use std::collections::HashSet;
use std::sync::Arc;

use gix_hash::ObjectId;

use crate::git::{AddedLine, GitReader, ReadParams};
use crate::refs::RefUpdate;
use crate::Error;

mod rules;

pub use rules::{Rule, RuleSet};

/// A secret found in a pushed commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub rule_id: String,
    pub description: String,
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub commit: String,
    /// The ref through which the commit was pushed.
    pub ref_name: String,
    /// The secret, redacted past its first characters.
    pub secret: String,
    /// `<commit>:<file>:<rule>:<line>`, stable across scans for allow-listing.
    pub fingerprint: String,
}

const VISIBLE_SECRET_CHARS: usize = 4;

/// Keep the first characters of `secret` and mask the rest.
pub fn redact(secret: &str) -> String {
    let visible: String = secret.chars().take(VISIBLE_SECRET_CHARS).collect();
    if visible.len() == secret.len() {
        return "*".repeat(secret.chars().count());
    }
    format!("{visible}*****")
}

/// Scans the commits new to a repository for secrets.
#[derive(Clone)]
pub struct SecretScanner {
    git: Arc<dyn GitReader>,
    rules: Arc<RuleSet>,
}

impl SecretScanner {
    pub fn new(git: Arc<dyn GitReader>, rules: Arc<RuleSet>) -> Self {
        SecretScanner { git, rules }
    }

    /// Findings in all commits reachable from the updated refs that the repository did not have.
    ///
    /// A commit reachable from several refs is attributed to the first of them.
    pub async fn scan(&self, params: &ReadParams, updates: &[RefUpdate]) -> Result<Vec<Finding>, Error> {
        let mut seen: HashSet<ObjectId> = HashSet::new();
        let mut findings = Vec::new();
        for update in updates.iter().filter(|u| !u.is_delete()) {
            let commits = self.git.new_commits(params, &[update.new]).await?;
            for commit in commits {
                if !seen.insert(commit) {
                    continue;
                }
                for patch in self.git.added_lines(params, commit).await? {
                    self.scan_lines(&patch.path, &patch.added, commit, &update.name, &mut findings);
                }
            }
        }
        Ok(findings)
    }

    fn scan_lines(&self, file: &str, lines: &[AddedLine], commit: ObjectId, ref_name: &str, out: &mut Vec<Finding>) {
        for (idx, line) in lines.iter().enumerate() {
            for rule in self.rules.iter() {
                let Some(secret) = rule.find(&line.text) else { continue };
                let end_line = rule
                    .block_end()
                    .and_then(|end| block_end_line(&lines[idx..], end))
                    .unwrap_or(line.number);
                let commit = commit.to_string();
                out.push(Finding {
                    rule_id: rule.id.to_owned(),
                    description: rule.description.to_owned(),
                    file: file.to_owned(),
                    start_line: line.number,
                    end_line,
                    fingerprint: format!("{commit}:{file}:{}:{}", rule.id, line.number),
                    commit,
                    ref_name: ref_name.to_owned(),
                    secret: redact(secret),
                });
            }
        }
    }
}

/// The number of the line closing a block that starts at `lines[0]`, if the block was added as a whole.
fn block_end_line(lines: &[AddedLine], end: &str) -> Option<u32> {
    let first = lines.first()?.number;
    lines
        .iter()
        .enumerate()
        .take_while(|(offset, l)| l.number == first + *offset as u32)
        .find(|(_, l)| l.text.contains(end))
        .map(|(_, l)| l.number)
}

impl std::fmt::Debug for SecretScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretScanner").field("rules", &self.rules).finish_non_exhaustive()
    }
}
