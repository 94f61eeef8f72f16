//! User-facing links printed to the pusher's terminal.

/// Builds web UI URLs below a base URL without a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlProvider {
    base_url: String,
}

impl UrlProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        UrlProvider {
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The page of pull request `number` in the repository at `repo_path`.
    pub fn pull_req_url(&self, repo_path: &str, number: i64) -> String {
        format!("{}/{}/pulls/{number}", self.base_url, repo_path.trim_matches('/'))
    }

    /// The page comparing `source` against `target`, from which a pull request can be opened.
    pub fn compare_url(&self, repo_path: &str, target: &str, source: &str) -> String {
        format!(
            "{}/{}/pulls/compare/{target}...{source}",
            self.base_url,
            repo_path.trim_matches('/')
        )
    }
}
