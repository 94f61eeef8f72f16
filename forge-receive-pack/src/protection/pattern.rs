use bstr::ByteSlice;
use serde::Deserialize;

/// Which branches a rule applies to.
///
/// Without `default` and `include` every branch matches. Otherwise a branch matches if it is
/// the repository's default branch and `default` is set, or if it matches an `include` glob.
/// A matching `exclude` glob always removes the branch again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pattern {
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Pattern {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if let Some(empty) = self.include.iter().chain(&self.exclude).find(|g| g.is_empty()) {
            return Err(format!("empty glob {empty:?} in pattern"));
        }
        Ok(())
    }

    /// True if the rule applies to `branch` in a repository whose default branch is `default_branch`.
    pub fn matches(&self, branch: &str, default_branch: &str) -> bool {
        let mut matches = !self.default && self.include.is_empty();
        matches = matches || (self.default && branch == default_branch);
        matches = matches || self.include.iter().any(|g| glob_match(g, branch));
        matches && !self.exclude.iter().any(|g| glob_match(g, branch))
    }
}

/// `*` stays within one path component, `**` crosses them.
fn glob_match(glob: &str, name: &str) -> bool {
    gix_glob::wildmatch(
        glob.as_bytes().as_bstr(),
        name.as_bytes().as_bstr(),
        gix_glob::wildmatch::Mode::NO_MATCH_SLASH_LITERAL,
    )
}
