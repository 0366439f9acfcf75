//! Asynchronous mirroring of committed booking and waitlist changes to outside
//! collaborators (calendars, remote persistence).
//!
//! The store writer hands every [`ChangeRecord`] to [`PublisherHandle::publish`], which
//! never blocks and never fails. Each sink has its own worker with its own retry loop,
//! so a slow or dead collaborator can only delay itself. Delivery is at least once;
//! sinks suppress duplicates and stale redeliveries with a [`DeliveryIndex`].

use std::cmp::Ordering as Order;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A collaborator that mirrors booking changes. Must tolerate duplicate delivery.
#[async_trait]
pub trait SyncSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, record: &ChangeRecord) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
        }
    }
}

/// A record a sink still refused after the last retry.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub sink: String,
    pub record: ChangeRecord,
    pub error: String,
}

struct Lane {
    sink: String,
    tx: mpsc::UnboundedSender<Arc<ChangeRecord>>,
}

/// Cheap-to-clone front of the publisher workers.
#[derive(Clone, Default)]
pub struct PublisherHandle {
    lanes: Arc<Vec<Lane>>,
    dead: Arc<Mutex<Vec<DeadLetter>>>,
}

impl PublisherHandle {
    /// A publisher with no sinks; records are dropped.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Spawn one worker per sink. Must run inside a tokio runtime.
    pub fn spawn(sinks: Vec<Arc<dyn SyncSink>>, policy: RetryPolicy) -> Self {
        let dead = Arc::new(Mutex::new(Vec::new()));
        let lanes = sinks
            .into_iter()
            .map(|sink| {
                let (tx, rx) = mpsc::unbounded_channel();
                let name = sink.name().to_string();
                tokio::spawn(run_lane(sink, rx, policy.clone(), dead.clone()));
                Lane { sink: name, tx }
            })
            .collect();
        Self {
            lanes: Arc::new(lanes),
            dead,
        }
    }

    pub fn publish(&self, record: ChangeRecord) {
        let record = Arc::new(record);
        for lane in self.lanes.iter() {
            if lane.tx.send(record.clone()).is_err() {
                warn!(sink = %lane.sink, "sync worker gone, dropping change record");
            }
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_dead().clone()
    }

    /// Queue every dead letter for another round of delivery. Returns how many were requeued.
    pub fn redeliver_dead_letters(&self) -> usize {
        let letters: Vec<DeadLetter> = self.lock_dead().drain(..).collect();
        let mut requeued = 0;
        for letter in letters {
            match self.lanes.iter().find(|l| l.sink == letter.sink) {
                Some(lane) if lane.tx.send(Arc::new(letter.record.clone())).is_ok() => requeued += 1,
                _ => self.lock_dead().push(letter),
            }
        }
        requeued
    }

    fn lock_dead(&self) -> MutexGuard<'_, Vec<DeadLetter>> {
        self.dead.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_lane(
    sink: Arc<dyn SyncSink>,
    mut rx: mpsc::UnboundedReceiver<Arc<ChangeRecord>>,
    policy: RetryPolicy,
    dead: Arc<Mutex<Vec<DeadLetter>>>,
) {
    while let Some(record) = rx.recv().await {
        match deliver_with_retry(sink.as_ref(), &record, &policy).await {
            Ok(attempts) => {
                metrics::counter!(observability::SYNC_DELIVERED_TOTAL, "sink" => sink.name().to_string())
                    .increment(1);
                if attempts > 1 {
                    debug!(sink = sink.name(), attempts, subject_id = %record.subject_id(), "delivered after retries");
                }
            }
            Err(e) => {
                error!(
                    sink = sink.name(),
                    subject_id = %record.subject_id(),
                    kind = record.kind.as_str(),
                    "sync delivery gave up, parking record: {e}"
                );
                metrics::counter!(observability::SYNC_DEAD_LETTERS_TOTAL, "sink" => sink.name().to_string())
                    .increment(1);
                dead.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(DeadLetter {
                        sink: sink.name().to_string(),
                        record: (*record).clone(),
                        error: e.to_string(),
                    });
            }
        }
    }
}

async fn deliver_with_retry(
    sink: &dyn SyncSink,
    record: &ChangeRecord,
    policy: &RetryPolicy,
) -> Result<u32, SinkError> {
    let mut attempt = 0;
    let mut delay = policy.backoff_base;
    loop {
        attempt += 1;
        match sink.deliver(record).await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                warn!(sink = sink.name(), attempt, subject_id = %record.subject_id(), "sync delivery failed, retrying: {e}");
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(policy.backoff_max);
            }
        }
    }
}

/// `delay` plus up to half of it again, so lanes retrying the same outage spread out.
fn jittered(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
    delay + Duration::from_millis(fastrand::u64(0..=spread))
}

/// Newest revision applied per booking or waitlist entry, with the kinds already
/// applied at that revision. One slot per subject, however often it changes.
#[derive(Default)]
pub struct DeliveryIndex {
    latest: DashMap<Ulid, (u64, u8)>,
}

impl DeliveryIndex {
    fn kind_bit(kind: ChangeKind) -> u8 {
        1 << (kind as u8)
    }

    /// `false` for a repeat, or for a record older than one already applied to the same subject.
    pub fn is_fresh(&self, record: &ChangeRecord) -> bool {
        let Some(seen) = self.latest.get(&record.subject_id()) else {
            return true;
        };
        let (revision, kinds) = *seen;
        match record.revision.cmp(&revision) {
            Order::Less => false,
            Order::Equal => kinds & Self::kind_bit(record.kind) == 0,
            Order::Greater => true,
        }
    }

    pub fn mark(&self, record: &ChangeRecord) {
        let bit = Self::kind_bit(record.kind);
        let mut seen = self.latest.entry(record.subject_id()).or_insert((record.revision, 0));
        match record.revision.cmp(&seen.0) {
            Order::Less => {}
            Order::Equal => seen.1 |= bit,
            Order::Greater => *seen = (record.revision, bit),
        }
    }

    /// Subjects tracked.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

// ── Sinks ────────────────────────────────────────────────────────

/// Writes each change as a structured log line.
pub struct LogSink;

#[async_trait]
impl SyncSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, record: &ChangeRecord) -> Result<(), SinkError> {
        match &record.subject {
            ChangeSubject::Booking(b) => info!(
                revision = record.revision,
                kind = record.kind.as_str(),
                booking_id = %b.id,
                user_id = %b.user_id,
                slot = %b.slot,
                "booking change"
            ),
            ChangeSubject::Waitlist(e) => info!(
                revision = record.revision,
                kind = record.kind.as_str(),
                entry_id = %e.id,
                user_id = %e.user_id,
                slot = %e.slot,
                "waitlist change"
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub booking_id: Ulid,
    pub slot: SlotKey,
    pub summary: String,
    pub attendee: Option<String>,
}

/// In-memory calendar: one entry per live booking. Applies each record once and
/// ignores waitlist traffic.
#[derive(Default)]
pub struct CalendarMirror {
    seen: DeliveryIndex,
    entries: DashMap<Ulid, CalendarEntry>,
    applied: AtomicU64,
}

impl CalendarMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, booking_id: &Ulid) -> Option<CalendarEntry> {
        self.entries.get(booking_id).map(|e| e.value().clone())
    }

    /// Records that changed the calendar (duplicates excluded).
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Bookings the duplicate filter remembers.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    fn upsert(&self, booking: &Booking) {
        let topic = booking.topic.as_deref().unwrap_or("Advisor");
        self.entries.insert(
            booking.id,
            CalendarEntry {
                booking_id: booking.id,
                slot: booking.slot.clone(),
                summary: format!("{topic} consultation ({})", booking.id),
                attendee: booking.contact.email.clone(),
            },
        );
    }
}

#[async_trait]
impl SyncSink for CalendarMirror {
    fn name(&self) -> &str {
        "calendar"
    }

    async fn deliver(&self, record: &ChangeRecord) -> Result<(), SinkError> {
        let Some(booking) = record.booking() else {
            return Ok(());
        };
        if !self.seen.is_fresh(record) {
            debug!(booking_id = %booking.id, kind = record.kind.as_str(), "duplicate delivery ignored");
            return Ok(());
        }
        match record.kind {
            ChangeKind::Created | ChangeKind::Amended => self.upsert(booking),
            ChangeKind::Rescheduled => {
                if let Some(old) = booking.rescheduled_from {
                    self.entries.remove(&old);
                }
                self.upsert(booking);
            }
            ChangeKind::Cancelled | ChangeKind::Moved => {
                self.entries.remove(&booking.id);
            }
            ChangeKind::WaitlistJoined | ChangeKind::WaitlistLeft => {}
        }
        self.seen.mark(record);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Append-only JSON-lines mirror on disk. Remembers what it already wrote across
/// restarts, so redelivery never duplicates a line.
pub struct JournalSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    seen: DeliveryIndex,
}

impl JournalSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let seen = DeliveryIndex::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<ChangeRecord>(line) {
                        Ok(record) => seen.mark(&record),
                        Err(e) => warn!(path = %path.display(), "skipping unreadable journal line: {e}"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            seen,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SyncSink for JournalSink {
    fn name(&self) -> &str {
        "journal"
    }

    async fn deliver(&self, record: &ChangeRecord) -> Result<(), SinkError> {
        let mut file = self.file.lock().await;
        if !self.seen.is_fresh(record) {
            return Ok(());
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;
        self.seen.mark(record);
        Ok(())
    }
}
