use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::publisher::PublisherHandle;
use crate::wal::Wal;

use super::document::{Document, Tx};
use super::EngineError;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound on waiting for the writer to answer a single commit.
    pub commit_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(5),
        }
    }
}

/// A mutation queued for the writer. Type-erased so commits with different
/// outputs share one channel.
trait Job: Send {
    /// Run the mutation against `tx`, holding its output until `finish`.
    fn run(&mut self, tx: &mut Tx) -> Result<(), EngineError>;

    /// Answer the caller: the held output on `Ok`, otherwise the error.
    fn finish(self: Box<Self>, result: Result<(), EngineError>);
}

struct TypedJob<T, F> {
    mutation: Option<F>,
    output: Option<T>,
    response: oneshot::Sender<Result<T, EngineError>>,
}

impl<T, F> Job for TypedJob<T, F>
where
    T: Send,
    F: FnOnce(&mut Tx) -> Result<T, EngineError> + Send,
{
    fn run(&mut self, tx: &mut Tx) -> Result<(), EngineError> {
        let mutation = self
            .mutation
            .take()
            .ok_or_else(|| EngineError::Invariant("commit mutation ran twice".into()))?;
        self.output = Some(mutation(tx)?);
        Ok(())
    }

    fn finish(self: Box<Self>, result: Result<(), EngineError>) {
        let TypedJob { output, response, .. } = *self;
        let reply = result.and_then(|()| {
            output.ok_or_else(|| EngineError::Invariant("commit finished without output".into()))
        });
        let _ = response.send(reply);
    }
}

struct PendingCommit {
    at: Ms,
    job: Box<dyn Job>,
}

/// A mutation that ran cleanly in the current batch and awaits the flush.
struct Staged {
    job: Box<dyn Job>,
    /// `None` when the mutation recorded nothing.
    record: Option<CommitRecord>,
    changes: Vec<(ChangeKind, ChangeSubject)>,
}

enum WriterCommand {
    Commit(PendingCommit),
    Compact {
        response: oneshot::Sender<Result<(), EngineError>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailWrites {
        response: oneshot::Sender<()>,
    },
}

/// Owns the WAL and the head document. The only task that ever runs a
/// mutation or publishes a new revision.
struct Writer {
    wal: Wal,
    head: Arc<Document>,
    state_tx: watch::Sender<Arc<Document>>,
    publisher: PublisherHandle,
    notify: Arc<NotifyHub>,
    /// Set after a failed write: disk and memory may disagree until a restart replays the WAL.
    poisoned: bool,
}

/// Background task that serialises commits and batches them for group commit.
/// 1. Block until the first Commit arrives.
/// 2. Drain all immediately available Commits (the batch window).
/// 3. Run each mutation in arrival order on top of the previous one's result.
/// 4. Single flush_sync for everything that recorded events.
/// 5. Publish the new head, hand out change records, respond.
async fn writer_loop(mut writer: Writer, mut rx: mpsc::Receiver<WriterCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Commit(first) => {
                let mut batch = vec![first];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WriterCommand::Commit(next)) => batch.push(next),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                writer.commit_batch(batch);
                if let Some(other) = deferred {
                    writer.handle_other(other);
                }
            }
            other => writer.handle_other(other),
        }
    }
    debug!("store writer stopped");
}

fn read_only() -> EngineError {
    EngineError::StoreUnavailable("store is read-only after a write failure".into())
}

/// `base` plus every record staged so far in this batch.
fn rebuild(base: &Document, staged: &[Staged]) -> Document {
    let mut doc = base.clone();
    for record in staged.iter().filter_map(|s| s.record.as_ref()) {
        for event in &record.events {
            doc.apply(event);
        }
        doc.revision = record.revision;
    }
    doc
}

impl Writer {
    fn commit_batch(&mut self, batch: Vec<PendingCommit>) {
        if self.poisoned {
            for pending in batch {
                pending.job.finish(Err(read_only()));
            }
            return;
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let base = self.head.clone();
        let mut working = Some((*base).clone());
        let mut staged: Vec<Staged> = Vec::with_capacity(batch.len());
        let mut append_err: Option<io::Error> = None;

        for PendingCommit { at, mut job } in batch {
            if append_err.is_some() {
                job.finish(Err(EngineError::StoreUnavailable("WAL append failed".into())));
                continue;
            }

            let doc = working.take().unwrap_or_else(|| rebuild(&base, &staged));
            let mut tx = Tx::new(doc, at);
            let result = job.run(&mut tx);
            let (mut doc, events, changes) = tx.into_parts();
            if let Err(e) = result {
                // Whatever it half-applied goes with `doc`; the next job rebuilds.
                job.finish(Err(e));
                continue;
            }
            if events.is_empty() {
                working = Some(doc);
                staged.push(Staged {
                    job,
                    record: None,
                    changes,
                });
                continue;
            }

            doc.revision += 1;
            let record = CommitRecord {
                revision: doc.revision,
                at,
                events,
            };
            if let Err(e) = self.wal.append_buffered(&record) {
                append_err = Some(e);
            }
            working = Some(doc);
            staged.push(Staged {
                job,
                record: Some(record),
                changes,
            });
        }

        if !staged.iter().any(|s| s.record.is_some()) {
            for s in staged {
                s.job.finish(Ok(()));
            }
            return;
        }

        // Always flush, even after an append error, so buffered bytes don't leak into a later batch.
        let flush_start = Instant::now();
        let flush_result = self.wal.flush_sync();
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        if let Some(e) = append_err.or(flush_result.err()) {
            error!("WAL write failed, store is now read-only: {e}");
            metrics::counter!(observability::WAL_WRITE_FAILURES_TOTAL).increment(1);
            self.poisoned = true;
            for s in staged {
                s.job
                    .finish(Err(EngineError::OutcomeUnknown(format!("WAL write failed: {e}"))));
            }
            return;
        }

        let head = Arc::new(working.unwrap_or_else(|| rebuild(&base, &staged)));
        self.head = head.clone();
        self.state_tx.send_replace(head);
        metrics::gauge!(observability::STORE_REVISION).set(self.head.revision as f64);

        for Staged { job, record, changes } in staged {
            if let Some(record) = record {
                for (kind, subject) in changes {
                    let change = ChangeRecord {
                        revision: record.revision,
                        kind,
                        subject,
                        at: record.at,
                    };
                    self.notify.send(change.advisor_id(), &change);
                    self.publisher.publish(change);
                }
            }
            job.finish(Ok(()));
        }
    }

    fn handle_other(&mut self, cmd: WriterCommand) {
        match cmd {
            WriterCommand::Compact { response } => {
                let _ = response.send(self.compact());
            }
            WriterCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            #[cfg(test)]
            WriterCommand::FailWrites { response } => {
                self.wal.fail_writes();
                let _ = response.send(());
            }
            WriterCommand::Commit(pending) => self.commit_batch(vec![pending]),
        }
    }

    fn compact(&mut self) -> Result<(), EngineError> {
        if self.poisoned {
            return Err(read_only());
        }
        let record = CommitRecord {
            revision: self.head.revision,
            at: super::clock::now_ms(),
            events: self.head.to_events(),
        };
        Wal::write_compact_file(self.wal.path(), std::slice::from_ref(&record))
            .map_err(|e| EngineError::StoreUnavailable(format!("compaction write failed: {e}")))?;
        if let Err(e) = self.wal.swap_compact_file() {
            error!("WAL swap failed, store is now read-only: {e}");
            self.poisoned = true;
            return Err(EngineError::StoreUnavailable(format!("compaction swap failed: {e}")));
        }
        info!(revision = self.head.revision, events = record.events.len(), "WAL compacted");
        Ok(())
    }
}

/// Durable versioned document with an atomic read-modify-write primitive.
pub struct Store {
    state: watch::Receiver<Arc<Document>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    options: StoreOptions,
}

impl Store {
    /// Replay the WAL at `path` and start the writer. Must run inside a tokio runtime.
    pub fn open(
        path: &Path,
        options: StoreOptions,
        publisher: PublisherHandle,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let records = Wal::recover(path)?;
        let mut doc = Document::default();
        for record in &records {
            for event in &record.events {
                doc.apply(event);
            }
            doc.revision = record.revision;
        }
        if let Err(problem) = doc.verify() {
            warn!(path = %path.display(), "replayed state is inconsistent: {problem}");
        }
        info!(
            path = %path.display(),
            revision = doc.revision,
            commits = records.len(),
            slots = doc.slots.len(),
            bookings = doc.bookings.len(),
            "store opened"
        );

        let wal = Wal::open(path)?;
        let head = Arc::new(doc);
        let (state_tx, state) = watch::channel(head.clone());
        let (writer_tx, writer_rx) = mpsc::channel(4096);
        let writer = Writer {
            wal,
            head,
            state_tx,
            publisher,
            notify,
            poisoned: false,
        };
        tokio::spawn(writer_loop(writer, writer_rx));

        Ok(Self {
            state,
            writer_tx,
            options,
        })
    }

    /// Latest committed revision. Never blocks on writers.
    pub fn snapshot(&self) -> Arc<Document> {
        self.state.borrow().clone()
    }

    /// Run `mutation` on the writer against the current head and commit what it
    /// emitted, all or nothing. Mutations run one at a time in arrival order, so
    /// each sees every commit accepted before it.
    ///
    /// A `CommitTimeout` only means the caller stopped waiting: the mutation is
    /// still queued and will be applied.
    pub async fn commit<T, F>(&self, now: Ms, mutation: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Tx) -> Result<T, EngineError> + Send + 'static,
    {
        let (response, rx) = oneshot::channel();
        let job = TypedJob {
            mutation: Some(mutation),
            output: None,
            response,
        };
        let cmd = WriterCommand::Commit(PendingCommit {
            at: now,
            job: Box::new(job),
        });
        let exchange = async {
            if self.writer_tx.send(cmd).await.is_err() {
                return Err(EngineError::StoreUnavailable("store writer shut down".into()));
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(EngineError::StoreUnavailable("store writer dropped response".into())),
            }
        };
        tokio::time::timeout(self.options.commit_timeout, exchange)
            .await
            .map_err(|_| {
                metrics::counter!(observability::COMMIT_TIMEOUTS_TOTAL).increment(1);
                EngineError::CommitTimeout
            })?
    }

    /// Rewrite the WAL as a single frame holding the current head.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let (response, rx) = oneshot::channel();
        self.writer_tx
            .send(WriterCommand::Compact { response })
            .await
            .map_err(|_| EngineError::StoreUnavailable("store writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("store writer dropped response".into()))?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .writer_tx
            .send(WriterCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Make every later WAL append fail.
    #[cfg(test)]
    pub async fn fail_writes(&self) {
        let (response, rx) = oneshot::channel();
        if self.writer_tx.send(WriterCommand::FailWrites { response }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
