//! Instance defaults of the content guards.

use gix_config::File;

use super::{boolean, integer, strings};
use crate::guard::codeowners::DEFAULT_PATHS;
use crate::Error;

/// Guard settings used for repositories that do not override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    pub secret_scanning_enabled: bool,
    /// Bytes; zero or less disables the oversize guard.
    pub file_size_limit: i64,
    /// Where to look for the CODEOWNERS file, first match wins.
    pub codeowners_paths: Vec<String>,
    pub codeowners_enabled: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            secret_scanning_enabled: false,
            file_size_limit: 500_000_000,
            codeowners_paths: DEFAULT_PATHS.iter().map(|p| (*p).to_owned()).collect(),
            codeowners_enabled: true,
        }
    }
}

impl GuardConfig {
    /// Parse `guards.secretScanningEnabled`, `guards.fileSizeLimit`, the multi-valued
    /// `guards.codeownersPath` and `guards.codeownersEnabled`.
    pub fn from_config(config: &File<'_>) -> Result<Self, Error> {
        let mut guards = Self::default();
        if let Some(enabled) = boolean(config, "guards.secretScanningEnabled")? {
            guards.secret_scanning_enabled = enabled;
        }
        if let Some(limit) = integer(config, "guards.fileSizeLimit")? {
            guards.file_size_limit = limit;
        }
        let paths = strings(config, "guards.codeownersPath");
        if !paths.is_empty() {
            if let Some(bad) = paths.iter().find(|p| p.is_empty() || p.starts_with('/')) {
                return Err(Error::Config(format!(
                    "'guards.codeownersPath' must be relative to the repository root, got: {bad:?}"
                )));
            }
            guards.codeowners_paths = paths;
        }
        if let Some(enabled) = boolean(config, "guards.codeownersEnabled")? {
            guards.codeowners_enabled = enabled;
        }
        Ok(guards)
    }
}
