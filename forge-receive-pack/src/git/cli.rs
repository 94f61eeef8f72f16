use std::ffi::OsString;
use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use bstr::ByteSlice;
use gix_hash::ObjectId;

use super::{prepare, AddedLine, FilePatch, GitReader, ObjectInfo, ReadParams};
use crate::Error;

/// [`GitReader`] implemented by running the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: OsString,
}

impl Default for GitCli {
    fn default() -> Self {
        GitCli::new("git")
    }
}

impl GitCli {
    pub fn new(binary: impl Into<OsString>) -> Self {
        GitCli { binary: binary.into() }
    }

    pub fn binary(&self) -> &std::ffi::OsStr {
        &self.binary
    }

    async fn output(&self, prepare: gix_command::Prepare) -> Result<Output, Error> {
        let mut cmd: std::process::Command = prepare.into();
        cmd.stdin(Stdio::null());
        self.output_of(cmd).await
    }

    async fn output_of(&self, cmd: std::process::Command) -> Result<Output, Error> {
        tracing::trace!(?cmd, "running git");
        Ok(tokio::process::Command::from(cmd).kill_on_drop(true).output().await?)
    }

    /// Run `git <args>` and return stdout, failing on a non-zero exit.
    async fn run(&self, params: &ReadParams, args: &[&str]) -> Result<Vec<u8>, Error> {
        let output = self
            .output(prepare(&self.binary, params)?.args(args.iter().copied()))
            .await?;
        if !output.status.success() {
            let subcommand = args
                .iter()
                .find(|a| !a.starts_with('-') && !a.contains('='))
                .copied()
                .unwrap_or_default();
            return Err(Error::git(subcommand, output.status, &output.stderr));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl GitReader for GitCli {
    async fn is_ancestor(&self, params: &ReadParams, ancestor: ObjectId, descendant: ObjectId) -> Result<bool, Error> {
        let (a, d) = (ancestor.to_string(), descendant.to_string());
        let output = self
            .output(prepare(&self.binary, params)?.args(["merge-base", "--is-ancestor", a.as_str(), d.as_str()]))
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::git("merge-base", output.status, &output.stderr)),
        }
    }

    async fn new_commits(&self, params: &ReadParams, tips: &[ObjectId]) -> Result<Vec<ObjectId>, Error> {
        if tips.is_empty() {
            return Ok(Vec::new());
        }
        let tips: Vec<String> = tips.iter().map(ToString::to_string).collect();
        let mut args = vec!["rev-list"];
        args.extend(tips.iter().map(String::as_str));
        args.extend(["--not", "--all"]);
        let out = self.run(params, &args).await?;
        out.lines()
            .filter(|l| !l.is_empty())
            .map(|l| ObjectId::from_hex(l).map_err(|e| Error::Protocol(format!("rev-list printed {:?}: {e}", l.as_bstr()))))
            .collect()
    }

    async fn added_lines(&self, params: &ReadParams, commit: ObjectId) -> Result<Vec<FilePatch>, Error> {
        let commit = commit.to_string();
        let out = self
            .run(
                params,
                &[
                    "-c",
                    "core.quotePath=false",
                    "diff-tree",
                    "-r",
                    "-p",
                    "-U0",
                    "--no-color",
                    "--no-renames",
                    "--no-commit-id",
                    "--root",
                    commit.as_str(),
                ],
            )
            .await?;
        Ok(parse_added_lines(&out))
    }

    async fn list_objects(&self, params: &ReadParams, object_dir: &Path) -> Result<Vec<ObjectInfo>, Error> {
        let scoped = ReadParams::new(&params.repo_dir);
        let mut cmd: std::process::Command = prepare(&self.binary, &scoped)?
            .args([
                "cat-file",
                "--batch-all-objects",
                "--batch-check=%(objectname) %(objecttype) %(objectsize)",
            ])
            .env("GIT_OBJECT_DIRECTORY", object_dir)
            .into();
        cmd.env_remove("GIT_ALTERNATE_OBJECT_DIRECTORIES").stdin(Stdio::null());
        let output = self.output_of(cmd).await?;
        if !output.status.success() {
            return Err(Error::git("cat-file", output.status, &output.stderr));
        }
        output
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(parse_batch_check)
            .collect()
    }

    async fn read_file(&self, params: &ReadParams, rev: ObjectId, path: &str) -> Result<Option<Vec<u8>>, Error> {
        let rev = rev.to_string();
        let listing = self.run(params, &["ls-tree", "-z", rev.as_str(), "--", path]).await?;
        let Some(entry) = listing.split_str("\0").find(|e| !e.is_empty()) else {
            return Ok(None);
        };
        // <mode> SP <type> SP <object> TAB <file>
        let mut fields = entry.split(|b| *b == b' ' || *b == b'\t');
        let (Some(_mode), Some(kind), Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            return Err(Error::Protocol(format!("unexpected ls-tree entry {:?}", entry.as_bstr())));
        };
        if kind != b"blob" {
            return Ok(None);
        }
        let id = id.to_str().map_err(|e| Error::Protocol(e.to_string()))?;
        self.run(params, &["cat-file", "blob", id]).await.map(Some)
    }

    async fn diff_file_names(&self, params: &ReadParams, old: ObjectId, new: ObjectId) -> Result<Vec<String>, Error> {
        let (old, new) = (old.to_string(), new.to_string());
        let out = self
            .run(
                params,
                &["diff", "--name-only", "--no-renames", "-z", old.as_str(), new.as_str()],
            )
            .await?;
        Ok(out
            .split_str("\0")
            .filter(|p| !p.is_empty())
            .map(|p| p.to_str_lossy().into_owned())
            .collect())
    }
}

fn parse_batch_check(line: &[u8]) -> Result<ObjectInfo, Error> {
    let bad = || Error::Protocol(format!("unexpected batch-check line {:?}", line.as_bstr()));
    let mut fields = line.splitn_str(3, " ");
    let (Some(id), Some(kind), Some(size)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(bad());
    };
    Ok(ObjectInfo {
        id: ObjectId::from_hex(id).map_err(|_| bad())?,
        kind: kind.to_str().map_err(|_| bad())?.parse()?,
        size: size.to_str().ok().and_then(|s| s.parse().ok()).ok_or_else(bad)?,
    })
}

/// Collect added lines from zero-context patch output.
pub(crate) fn parse_added_lines(patch: &[u8]) -> Vec<FilePatch> {
    let mut files: Vec<FilePatch> = Vec::new();
    let mut current: Option<usize> = None;
    let mut in_header = false;
    let mut next_line = 0u32;
    for line in patch.lines() {
        if line.starts_with(b"diff --git ") {
            in_header = true;
            current = None;
            continue;
        }
        if in_header {
            if let Some(path) = line.strip_prefix(b"+++ ") {
                if path != b"/dev/null" {
                    let path = path.strip_prefix(b"b/").unwrap_or(path);
                    files.push(FilePatch {
                        path: path.to_str_lossy().into_owned(),
                        added: Vec::new(),
                    });
                    current = Some(files.len() - 1);
                }
                continue;
            }
            if !line.starts_with(b"@@") {
                continue;
            }
            in_header = false;
        }
        if line.starts_with(b"@@") {
            next_line = hunk_new_start(line).unwrap_or(0);
            continue;
        }
        if let Some(text) = line.strip_prefix(b"+") {
            if let Some(file) = current.and_then(|idx| files.get_mut(idx)) {
                file.added.push(AddedLine {
                    number: next_line,
                    text: text.to_str_lossy().into_owned(),
                });
            }
            next_line += 1;
        }
    }
    files.retain(|f| !f.added.is_empty());
    files
}

/// The start line of the new side in `@@ -a,b +c,d @@`.
fn hunk_new_start(line: &[u8]) -> Option<u32> {
    let plus = line.find_byte(b'+')?;
    let rest = &line[plus + 1..];
    let end = rest.find_byteset(b", ").unwrap_or(rest.len());
    rest[..end].to_str().ok()?.parse().ok()
}
