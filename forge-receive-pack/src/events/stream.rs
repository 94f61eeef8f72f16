//! Append-only event stream backends.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::Record;
use crate::Error;

/// An append-only sequence of records, addressed by 0-based offset.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Append `record` durably and return its offset.
    async fn append(&self, record: Record) -> Result<u64, Error>;

    /// Up to `max` records starting at `offset`.
    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<(u64, Record)>, Error>;

    /// The number of records, updated on every append.
    fn head(&self) -> watch::Receiver<u64>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn slice(records: &[Record], offset: u64, max: usize) -> Vec<(u64, Record)> {
    records
        .iter()
        .enumerate()
        .skip(offset as usize)
        .take(max)
        .map(|(idx, r)| (idx as u64, r.clone()))
        .collect()
}

/// Keeps records in memory only.
#[derive(Debug)]
pub struct MemoryStream {
    records: Mutex<Vec<Record>>,
    head: watch::Sender<u64>,
}

impl Default for MemoryStream {
    fn default() -> Self {
        MemoryStream {
            records: Mutex::default(),
            head: watch::channel(0).0,
        }
    }
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of all records, for inspection.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl EventStream for MemoryStream {
    async fn append(&self, record: Record) -> Result<u64, Error> {
        let mut records = lock(&self.records);
        records.push(record);
        let len = records.len() as u64;
        self.head.send_replace(len);
        Ok(len - 1)
    }

    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<(u64, Record)>, Error> {
        Ok(slice(&lock(&self.records), offset, max))
    }

    fn head(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }
}

/// Records as JSON lines in a file, synced to disk before an append returns.
///
/// The file is read back on open, so offsets survive restarts. A torn last line, left by a
/// crash in the middle of an append, is dropped. A failed append is cut off the file again so a
/// retry starts on a fresh line.
#[derive(Debug)]
pub struct FileStream {
    path: PathBuf,
    file: tokio::sync::Mutex<Appender>,
    records: Mutex<Vec<Record>>,
    head: watch::Sender<u64>,
}

impl FileStream {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let (records, torn) = match tokio::fs::read_to_string(&path).await {
            Ok(text) => parse_lines(&path, &text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (Vec::new(), false),
            Err(err) => return Err(err.into()),
        };
        let file = if torn {
            rewrite(&path, &records).await?
        } else {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?
        };
        let committed = file.metadata().await?.len();
        tracing::debug!(path = %path.display(), records = records.len(), "event stream opened");
        let head = watch::channel(records.len() as u64).0;
        Ok(FileStream {
            path,
            file: tokio::sync::Mutex::new(Appender { file, committed }),
            records: Mutex::new(records),
            head,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The open file and the length of its fully written records.
#[derive(Debug)]
struct Appender {
    file: tokio::fs::File,
    committed: u64,
}

impl Appender {
    async fn append(&mut self, line: &[u8]) -> Result<(), Error> {
        let len = self.file.metadata().await?.len();
        if len != self.committed {
            tracing::warn!(len, committed = self.committed, "cutting leftovers of a failed event append");
            self.file.set_len(self.committed).await?;
        }
        let written = async {
            self.file.write_all(line).await?;
            self.file.sync_data().await
        }
        .await;
        if let Err(err) = written {
            if let Err(cut) = self.file.set_len(self.committed).await {
                tracing::warn!(error = %cut, "failed event append left bytes behind");
            }
            return Err(err.into());
        }
        self.committed += line.len() as u64;
        Ok(())
    }
}

fn line_of(record: &Record) -> Result<Vec<u8>, Error> {
    let mut line = serde_json::to_vec(record).map_err(|e| Error::Bug(format!("unserializable event record: {e}")))?;
    line.push(b'\n');
    Ok(line)
}

/// The intact records of `text` and whether a torn last line was dropped.
fn parse_lines(path: &Path, text: &str) -> Result<(Vec<Record>, bool), Error> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut records = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        let is_last = idx + 1 == lines.len();
        let complete = line.ends_with('\n');
        match serde_json::from_str::<Record>(line.trim_end_matches('\n')) {
            Ok(record) if complete => records.push(record),
            Err(err) if !is_last => {
                return Err(Error::Store(format!(
                    "corrupt event record at {}:{}: {err}",
                    path.display(),
                    idx + 1
                )))
            }
            _ => {
                tracing::warn!(path = %path.display(), line = idx + 1, "dropping torn event record");
                return Ok((records, true));
            }
        }
    }
    Ok((records, false))
}

async fn rewrite(path: &Path, records: &[Record]) -> Result<tokio::fs::File, Error> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend(line_of(record)?);
    }
    let tmp = path.with_extension("rewrite");
    tokio::fs::write(&tmp, &buf).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(tokio::fs::OpenOptions::new().append(true).open(path).await?)
}

#[async_trait]
impl EventStream for FileStream {
    async fn append(&self, record: Record) -> Result<u64, Error> {
        let line = line_of(&record)?;
        self.file.lock().await.append(&line).await?;
        let offset = {
            let mut records = lock(&self.records);
            records.push(record);
            records.len() as u64
        };
        self.head.send_replace(offset);
        Ok(offset - 1)
    }

    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<(u64, Record)>, Error> {
        Ok(slice(&lock(&self.records), offset, max))
    }

    fn head(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }
}
