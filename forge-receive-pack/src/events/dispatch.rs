//! Delivery of stream records to event handlers.
//!
//! Every handler consumes the stream independently from its own stored offset, in stream
//! order. A record is delivered at least once: the offset only advances after the handler
//! returned successfully or the record was dead-lettered. A [`Semaphore`] bounds how many
//! deliveries run at the same time across all handlers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{EventKind, EventStream, Record};
use crate::error::RetryStrategy;
use crate::Error;

const BATCH: usize = 64;
/// Dead letters kept per dispatcher or reporter; older ones are only in the logs.
const DEAD_LETTER_CAPACITY: usize = 1024;

/// A consumer of events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identifies the handler's offset; must stay stable across restarts.
    fn name(&self) -> &str;

    /// The kinds this handler wants, all others are skipped.
    fn kinds(&self) -> &[EventKind];

    async fn handle(&self, record: &Record) -> Result<(), Error>;
}

/// Where handlers' offsets are kept.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// The offset of the next record `consumer` has not seen, zero for new consumers.
    async fn load(&self, consumer: &str) -> Result<u64, Error>;
    async fn save(&self, consumer: &str, offset: u64) -> Result<(), Error>;
}

#[derive(Debug, Default)]
pub struct MemoryOffsets {
    offsets: Mutex<HashMap<String, u64>>,
}

impl MemoryOffsets {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsets {
    async fn load(&self, consumer: &str) -> Result<u64, Error> {
        Ok(self
            .offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(consumer)
            .copied()
            .unwrap_or(0))
    }

    async fn save(&self, consumer: &str, offset: u64) -> Result<(), Error> {
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consumer.to_owned(), offset);
        Ok(())
    }
}

/// Offsets as a JSON object in a file, replaced atomically on every save.
#[derive(Debug)]
pub struct FileOffsets {
    path: std::path::PathBuf,
    offsets: tokio::sync::Mutex<HashMap<String, u64>>,
}

impl FileOffsets {
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let offsets = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Store(format!("corrupt offsets in {}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(FileOffsets {
            path,
            offsets: tokio::sync::Mutex::new(offsets),
        })
    }
}

#[async_trait]
impl OffsetStore for FileOffsets {
    async fn load(&self, consumer: &str) -> Result<u64, Error> {
        Ok(self.offsets.lock().await.get(consumer).copied().unwrap_or(0))
    }

    async fn save(&self, consumer: &str, offset: u64) -> Result<(), Error> {
        let mut offsets = self.offsets.lock().await;
        offsets.insert(consumer.to_owned(), offset);
        let bytes = serde_json::to_vec(&*offsets).map_err(|e| Error::Bug(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// A record that could not be stored or delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// The handler that failed, `None` if publishing itself failed.
    pub consumer: Option<String>,
    pub record: Record,
    pub error: String,
}

/// The most recent dead letters, oldest first.
#[derive(Debug, Clone)]
pub struct DeadLetters {
    capacity: usize,
    letters: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl Default for DeadLetters {
    fn default() -> Self {
        Self::with_capacity(DEAD_LETTER_CAPACITY)
    }
}

impl DeadLetters {
    pub fn with_capacity(capacity: usize) -> Self {
        DeadLetters {
            capacity: capacity.max(1),
            letters: Arc::default(),
        }
    }

    pub fn push(&self, letter: DeadLetter) {
        let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        if letters.len() == self.capacity {
            letters.pop_front();
        }
        letters.push_back(letter);
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return everything kept so far.
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect()
    }
}

/// Runs registered handlers over the event stream.
#[derive(Clone)]
pub struct Dispatcher {
    stream: Arc<dyn EventStream>,
    offsets: Arc<dyn OffsetStore>,
    handlers: Vec<Arc<dyn EventHandler>>,
    permits: Arc<Semaphore>,
    retry: RetryStrategy,
    dead_letters: DeadLetters,
}

impl Dispatcher {
    pub fn new(stream: Arc<dyn EventStream>, offsets: Arc<dyn OffsetStore>, workers: usize, max_attempts: u32) -> Self {
        Dispatcher {
            stream,
            offsets,
            handlers: Vec::new(),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            retry: RetryStrategy::ExponentialBackoff { max_attempts },
            dead_letters: DeadLetters::default(),
        }
    }

    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn dead_letters(&self) -> &DeadLetters {
        &self.dead_letters
    }

    /// Deliver everything currently in the stream to every handler and return the number of
    /// deliveries made.
    pub async fn run_once(&self) -> Result<usize, Error> {
        let mut delivered = 0;
        for handler in &self.handlers {
            delivered += self.catch_up(handler.as_ref()).await?;
        }
        Ok(delivered)
    }

    /// Run one task per handler, waking up on appends, until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for handler in self.handlers.clone() {
            let this = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let mut head = this.stream.head();
                loop {
                    if let Err(err) = this.catch_up(handler.as_ref()).await {
                        tracing::error!(consumer = handler.name(), error = %err, "event consumer stalled");
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        changed = head.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        tasks
    }

    async fn catch_up(&self, handler: &dyn EventHandler) -> Result<usize, Error> {
        let mut offset = self.offsets.load(handler.name()).await?;
        let mut delivered = 0;
        loop {
            let batch = self.stream.read_from(offset, BATCH).await?;
            if batch.is_empty() {
                return Ok(delivered);
            }
            for (at, record) in batch {
                if handler.kinds().contains(&record.kind()) {
                    self.deliver(handler, &record).await;
                    delivered += 1;
                }
                offset = at + 1;
            }
            self.offsets.save(handler.name(), offset).await?;
        }
    }

    async fn deliver(&self, handler: &dyn EventHandler, record: &Record) {
        let mut attempt = 1;
        loop {
            let outcome = {
                let _permit = match self.permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                handler.handle(record).await
            };
            match outcome {
                Ok(()) => return,
                Err(err) => match self.retry.delay(attempt) {
                    Some(pause) => {
                        tracing::warn!(consumer = handler.name(), kind = %record.kind(), attempt, error = %err, "event delivery failed, retrying");
                        tokio::time::sleep(pause).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::error!(consumer = handler.name(), kind = %record.kind(), error = %err, "event delivery failed, dead-lettering");
                        self.dead_letters.push(DeadLetter {
                            consumer: Some(handler.name().to_owned()),
                            record: record.clone(),
                            error: err.to_string(),
                        });
                        return;
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.iter().map(|h| h.name().to_owned()).collect::<Vec<_>>())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::events::{MemoryStream, RefCreatedPayload};

    struct Collect {
        kinds: Vec<EventKind>,
        seen: Mutex<Vec<String>>,
        fail_first: AtomicU32,
    }

    impl Collect {
        fn new(kinds: Vec<EventKind>, fail_first: u32) -> Arc<Self> {
            Arc::new(Collect {
                kinds,
                seen: Mutex::default(),
                fail_first: AtomicU32::new(fail_first),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        fn kinds(&self) -> &[EventKind] {
            &self.kinds
        }

        async fn handle(&self, record: &Record) -> Result<(), Error> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Transport("webhook target down".into()));
            }
            let payload: RefCreatedPayload = record.payload()?;
            self.seen.lock().unwrap().push(payload.ref_name);
            Ok(())
        }
    }

    async fn publish(stream: &MemoryStream, kind: EventKind, name: &str) {
        let payload = RefCreatedPayload {
            repo_id: 1,
            principal_id: 1,
            ref_name: name.into(),
            sha: "0".into(),
        };
        stream.append(Record::new(kind, "t", &payload).unwrap()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_order_filtered_by_kind_and_tracks_offsets() {
        let stream = Arc::new(MemoryStream::new());
        publish(&stream, EventKind::BranchCreated, "a").await;
        publish(&stream, EventKind::TagCreated, "t").await;
        publish(&stream, EventKind::BranchCreated, "b").await;

        let offsets = Arc::new(MemoryOffsets::new());
        let handler = Collect::new(vec![EventKind::BranchCreated], 1);
        let dispatcher = Dispatcher::new(stream.clone(), offsets.clone(), 2, 3).register(handler.clone());

        assert_eq!(dispatcher.run_once().await.unwrap(), 2);
        assert_eq!(handler.seen(), vec!["a", "b"]);
        assert_eq!(offsets.load("collect").await.unwrap(), 3);

        assert_eq!(dispatcher.run_once().await.unwrap(), 0);
        publish(&stream, EventKind::BranchCreated, "c").await;
        dispatcher.run_once().await.unwrap();
        assert_eq!(handler.seen(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_deliveries_are_dead_lettered_and_skipped() {
        let stream = Arc::new(MemoryStream::new());
        publish(&stream, EventKind::BranchCreated, "a").await;
        publish(&stream, EventKind::BranchCreated, "b").await;
        let handler = Collect::new(vec![EventKind::BranchCreated], 3);
        let dispatcher =
            Dispatcher::new(stream, Arc::new(MemoryOffsets::new()), 1, 3).register(handler.clone());

        dispatcher.run_once().await.unwrap();
        assert_eq!(handler.seen(), vec!["b"]);
        let dead = dispatcher.dead_letters().snapshot();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].consumer.as_deref(), Some("collect"));
        assert_eq!(dispatcher.dead_letters().drain().len(), 1);
        assert!(dispatcher.dead_letters().snapshot().is_empty());
    }

    /// Counts saves on top of memory offsets.
    #[derive(Default)]
    struct CountingOffsets {
        inner: MemoryOffsets,
        saves: AtomicU32,
    }

    #[async_trait]
    impl OffsetStore for CountingOffsets {
        async fn load(&self, consumer: &str) -> Result<u64, Error> {
            self.inner.load(consumer).await
        }

        async fn save(&self, consumer: &str, offset: u64) -> Result<(), Error> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(consumer, offset).await
        }
    }

    #[tokio::test]
    async fn offsets_are_saved_once_per_batch() {
        let stream = Arc::new(MemoryStream::new());
        for name in ["a", "b", "c"] {
            publish(&stream, EventKind::TagCreated, name).await;
        }
        publish(&stream, EventKind::BranchCreated, "d").await;
        let offsets = Arc::new(CountingOffsets::default());
        let handler = Collect::new(vec![EventKind::BranchCreated], 0);
        let dispatcher = Dispatcher::new(stream, offsets.clone(), 1, 3).register(handler.clone());

        assert_eq!(dispatcher.run_once().await.unwrap(), 1);
        assert_eq!(offsets.saves.load(Ordering::SeqCst), 1);
        assert_eq!(offsets.load("collect").await.unwrap(), 4);
    }

    #[test]
    fn dead_letters_keep_only_the_most_recent() {
        let letters = DeadLetters::with_capacity(2);
        for sha in ["1", "2", "3"] {
            let payload = RefCreatedPayload {
                repo_id: 1,
                principal_id: 1,
                ref_name: "refs/heads/x".into(),
                sha: sha.into(),
            };
            letters.push(DeadLetter {
                consumer: None,
                record: Record::new(EventKind::BranchCreated, "t", &payload).unwrap(),
                error: "down".into(),
            });
        }
        let kept: Vec<String> = letters
            .snapshot()
            .iter()
            .map(|l| l.record.payload::<RefCreatedPayload>().unwrap().sha)
            .collect();
        assert_eq!(kept, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn file_offsets_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        FileOffsets::open(&path).await.unwrap().save("webhooks", 7).await.unwrap();
        assert_eq!(FileOffsets::open(&path).await.unwrap().load("webhooks").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn spawned_consumers_follow_the_head() {
        let stream = Arc::new(MemoryStream::new());
        let handler = Collect::new(vec![EventKind::BranchCreated], 0);
        let dispatcher =
            Dispatcher::new(stream.clone(), Arc::new(MemoryOffsets::new()), 4, 3).register(handler.clone());
        let cancel = CancellationToken::new();
        let mut tasks = dispatcher.spawn(cancel.clone());

        publish(&stream, EventKind::BranchCreated, "live").await;
        for _ in 0..100 {
            if !handler.seen().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(handler.seen(), vec!["live"]);
        cancel.cancel();
        while tasks.join_next().await.is_some() {}
    }
}
