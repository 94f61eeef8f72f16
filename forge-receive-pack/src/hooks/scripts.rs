//! Installation of the hook shims `receive-pack` executes.

use std::path::{Path, PathBuf};

use super::HookKind;
use crate::Error;

/// Write one shim per [`HookKind`] into `dir`, each exec'ing `binary <hook> "$@"`.
///
/// Existing shims are overwritten so a changed binary path takes effect. Returns the written paths.
pub fn install(dir: &Path, binary: &Path) -> Result<Vec<PathBuf>, Error> {
    std::fs::create_dir_all(dir)?;
    let binary = binary.to_str().ok_or_else(|| {
        Error::Config(format!("hook binary path {binary:?} is not valid UTF-8"))
    })?;
    let mut written = Vec::with_capacity(HookKind::ALL.len());
    for kind in HookKind::ALL {
        let path = dir.join(kind.as_str());
        std::fs::write(&path, script(binary, kind))?;
        make_executable(&path)?;
        written.push(path);
    }
    tracing::debug!(dir = %dir.display(), "installed hook shims");
    Ok(written)
}

fn script(binary: &str, kind: HookKind) -> String {
    format!("#!/bin/sh\nexec {} {} \"$@\"\n", shell_quote(binary), kind.as_str())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), Error> {
    Ok(())
}
