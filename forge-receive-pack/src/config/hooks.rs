//! Hook callback configuration parsing from Git config.

use std::path::PathBuf;

use gix_config::File;

use super::string;
use crate::Error;

/// How the spawned `receive-pack` reaches back into the server.
///
/// The hook scripts in `dir` exec `binary`, which posts to `callback_url`. Without a callback
/// URL no hooks are wired and every push is accepted by git alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    /// Base URL of the hook callback server, e.g. `http://127.0.0.1:3001`.
    pub callback_url: Option<String>,
    /// Path of the `forge-hook` executable.
    pub binary: PathBuf,
    /// Directory with the hook scripts, passed to git as `core.hooksPath`.
    pub dir: Option<PathBuf>,
}

impl Default for HookConfig {
    fn default() -> Self {
        HookConfig {
            callback_url: None,
            binary: PathBuf::from("forge-hook"),
            dir: None,
        }
    }
}

impl HookConfig {
    /// Load hook configuration from a Git config file.
    ///
    /// This method parses the following configuration keys:
    /// - `hooks.callbackUrl`: base URL of the callback server
    /// - `hooks.binary`: the hook executable (default: `forge-hook`)
    /// - `hooks.dir`: the hook script directory
    pub fn from_config(config: &File<'_>) -> Result<Self, Error> {
        let callback_url = string(config, "hooks.callbackUrl").map(|u| u.trim_end_matches('/').to_owned());
        if let Some(url) = &callback_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "'hooks.callbackUrl' must be an http(s) URL, got: {url}"
                )));
            }
        }
        let dir = string(config, "hooks.dir").map(PathBuf::from);
        if callback_url.is_some() && dir.is_none() {
            return Err(Error::Config("'hooks.dir' is required when 'hooks.callbackUrl' is set".into()));
        }
        Ok(HookConfig {
            callback_url,
            binary: string(config, "hooks.binary").map_or_else(|| HookConfig::default().binary, PathBuf::from),
            dir,
        })
    }

    /// Whether pushes are routed through the hook callbacks.
    pub fn is_enabled(&self) -> bool {
        self.callback_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> Result<HookConfig, Error> {
        let file = File::try_from(text).unwrap();
        HookConfig::from_config(&file)
    }

    #[test]
    fn disabled_without_callback_url() {
        let config = load("").unwrap();
        assert!(!config.is_enabled());
        assert_eq!(config.binary, PathBuf::from("forge-hook"));
    }

    #[test]
    fn parse_callback_settings() {
        let config = load(
            "[hooks]\n\tcallbackUrl = http://127.0.0.1:3001/\n\tbinary = /usr/libexec/forge-hook\n\tdir = /var/lib/forge/hooks\n",
        )
        .unwrap();
        assert_eq!(config.callback_url.as_deref(), Some("http://127.0.0.1:3001"));
        assert_eq!(config.binary, PathBuf::from("/usr/libexec/forge-hook"));
        assert_eq!(config.dir, Some(PathBuf::from("/var/lib/forge/hooks")));
    }

    #[test]
    fn callback_url_must_be_http_and_needs_a_dir() {
        assert!(load("[hooks]\n\tcallbackUrl = unix:/tmp/sock\n\tdir = /h\n").is_err());
        let err = load("[hooks]\n\tcallbackUrl = http://localhost\n").unwrap_err();
        assert!(err.to_string().contains("'hooks.dir' is required"));
    }
}
