mod admin;
mod availability;
mod booking;
mod clock;
mod document;
mod error;
mod queries;
mod store;
mod waitlist;

pub use availability::{available_dates, list_available, slot_overview};
pub use clock::{Clock, ManualClock, SystemClock};
pub use document::{Document, Tx};
pub use error::{EngineError, ErrorKind};
pub use store::{Store, StoreOptions};

use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::publisher::PublisherHandle;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Offset slot dates/times are read in when deciding whether a slot has started.
    pub utc_offset: FixedOffset,
    pub store: StoreOptions,
}

impl EngineConfig {
    pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            utc_offset: FixedOffset::east_opt(Self::DEFAULT_UTC_OFFSET_MINUTES * 60)
                .unwrap_or_else(|| Utc.fix()),
            store: StoreOptions::default(),
        }
    }
}

/// The scheduling engine: booking, waitlist and availability over one [`Store`].
///
/// Every mutation is a single store commit run on the store writer, so the
/// multi-entity changes it makes (seat counts, booking rows, waitlist queues)
/// are never observed half-applied. User ids are stored in
/// [`canonical_user_id`] form.
pub struct Engine {
    store: Store,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn open(
        wal_path: &Path,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        publisher: PublisherHandle,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let store = Store::open(wal_path, config.store, publisher, notify.clone())?;
        Ok(Self {
            store,
            clock,
            offset: config.utc_offset,
            notify,
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn snapshot(&self) -> Arc<Document> {
        self.store.snapshot()
    }

    pub fn revision(&self) -> u64 {
        self.store.snapshot().revision
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    pub async fn compact(&self) -> Result<(), EngineError> {
        self.store.compact().await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.appends_since_compact().await
    }
}

/// The slot if it exists and hasn't started yet.
pub(crate) fn bookable_slot<'a>(
    doc: &'a Document,
    key: &SlotKey,
    offset: FixedOffset,
    now: Ms,
) -> Result<&'a Slot, EngineError> {
    let slot = doc.slot(key).ok_or_else(|| EngineError::InvalidSlot {
        slot: key.clone(),
        reason: "no such slot",
    })?;
    if key.has_started(offset, now) {
        return Err(EngineError::InvalidSlot {
            slot: key.clone(),
            reason: "slot is in the past",
        });
    }
    Ok(slot)
}
