use chrono::FixedOffset;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::booking::validate_party;
use super::{bookable_slot, Engine, EngineError, Tx};

/// Queue `user_id` on `slot` inside `tx`. The caller has already decided the slot is full.
pub(super) fn enqueue_in(
    tx: &mut Tx,
    slot: &SlotKey,
    user_id: &str,
    contact: &Contact,
    topic: Option<&str>,
) -> Result<WaitlistTicket, EngineError> {
    if tx.doc().waitlist_entry(slot, user_id).is_some() {
        return Err(EngineError::AlreadyWaitlisted {
            user_id: user_id.to_string(),
            slot: slot.clone(),
        });
    }
    if tx.doc().waitlist_len(slot) >= MAX_WAITLIST_PER_SLOT {
        return Err(EngineError::LimitExceeded("waitlist for slot is full"));
    }
    let entry = WaitlistEntry {
        id: Ulid::new(),
        slot: slot.clone(),
        user_id: user_id.to_string(),
        contact: contact.clone(),
        topic: topic.map(str::to_string),
        enqueued_at: tx.now(),
        seq: tx.doc().next_seq(),
    };
    let entry_id = entry.id;
    tx.emit(Event::WaitlistJoined { entry })?;
    Ok(WaitlistTicket {
        entry_id,
        slot: slot.clone(),
        user_id: user_id.to_string(),
        position: tx.doc().waitlist_len(slot),
    })
}

/// Fill free seats on `slot` from the front of its queue, inside `tx`.
///
/// Entries whose user already holds a confirmed booking elsewhere are dropped
/// and the next entry is tried. Nothing is promoted into a slot that has started.
pub(super) fn promote_in(
    tx: &mut Tx,
    slot: &SlotKey,
    offset: FixedOffset,
) -> Result<Vec<Booking>, EngineError> {
    let mut promoted = Vec::new();
    if slot.has_started(offset, tx.now()) {
        return Ok(promoted);
    }
    loop {
        let free = tx.doc().slot(slot).map_or(0, |s| s.remaining());
        if free == 0 {
            break;
        }
        let Some(head) = tx.doc().queue(slot).next().cloned() else {
            break;
        };
        tx.emit(Event::WaitlistLeft {
            slot: slot.clone(),
            user_id: head.user_id.clone(),
        })?;
        if let Some(active) = tx.doc().active_booking(&head.user_id) {
            debug!(
                user_id = %head.user_id,
                booking_id = %active.id,
                %slot,
                "dropping waitlist entry: user already booked"
            );
            continue;
        }
        let now = tx.now();
        let booking = Booking {
            id: Ulid::new(),
            user_id: head.user_id,
            contact: head.contact,
            topic: head.topic,
            slot: slot.clone(),
            status: BookingStatus::Confirmed,
            created_at: now,
            updated_at: now,
            rescheduled_from: None,
            via_waitlist: true,
        };
        tx.emit(Event::BookingWritten {
            booking: booking.clone(),
        })?;
        promoted.push(booking);
    }
    Ok(promoted)
}

/// Count and log promotions once their commit is durable.
pub(super) fn record_promotions(promoted: &[Booking]) {
    if promoted.is_empty() {
        return;
    }
    metrics::counter!(observability::PROMOTIONS_TOTAL).increment(promoted.len() as u64);
    for b in promoted {
        info!(booking_id = %b.id, user_id = %b.user_id, slot = %b.slot, "promoted from waitlist");
    }
}

impl Engine {
    /// Queue for a slot that has no seats left.
    pub async fn join_waitlist(
        &self,
        user_id: &str,
        contact: &Contact,
        topic: Option<&str>,
        slot: &SlotKey,
    ) -> Result<WaitlistTicket, EngineError> {
        let user_id = canonical_user_id(user_id);
        validate_party(&user_id, contact, topic)?;
        let offset = self.offset;
        let (slot, contact, topic) = (slot.clone(), contact.clone(), topic.map(str::to_string));
        let ticket = self
            .store
            .commit(self.now(), move |tx| {
                let free = bookable_slot(tx.doc(), &slot, offset, tx.now())?.remaining();
                if free > 0 {
                    return Err(EngineError::SlotNotFull(slot));
                }
                enqueue_in(tx, &slot, &user_id, &contact, topic.as_deref())
            })
            .await?;
        info!(
            entry_id = %ticket.entry_id,
            user_id = %ticket.user_id,
            slot = %ticket.slot,
            position = ticket.position,
            "waitlisted"
        );
        Ok(ticket)
    }

    /// Leave the queue on `slot`. `false` if the user wasn't on it.
    pub async fn withdraw(&self, user_id: &str, slot: &SlotKey) -> Result<bool, EngineError> {
        let user_id = canonical_user_id(user_id);
        let slot = slot.clone();
        self.store
            .commit(self.now(), move |tx| {
                if tx.doc().waitlist_entry(&slot, &user_id).is_none() {
                    return Ok(false);
                }
                tx.emit(Event::WaitlistLeft { slot, user_id })?;
                Ok(true)
            })
            .await
    }

    pub async fn withdraw_entry(&self, entry_id: Ulid) -> Result<WaitlistEntry, EngineError> {
        self.store
            .commit(self.now(), move |tx| {
                let (entry, _) = tx
                    .doc()
                    .find_waitlist_entry(&entry_id)
                    .ok_or(EngineError::WaitlistEntryNotFound(entry_id))?;
                let entry = entry.clone();
                tx.emit(Event::WaitlistLeft {
                    slot: entry.slot.clone(),
                    user_id: entry.user_id.clone(),
                })?;
                Ok(entry)
            })
            .await
    }

    /// Current queue position for a ticket.
    pub fn waitlist_ticket(&self, entry_id: Ulid) -> Result<WaitlistTicket, EngineError> {
        let doc = self.snapshot();
        let (entry, position) = doc
            .find_waitlist_entry(&entry_id)
            .ok_or(EngineError::WaitlistEntryNotFound(entry_id))?;
        Ok(WaitlistTicket {
            entry_id,
            slot: entry.slot.clone(),
            user_id: entry.user_id.clone(),
            position,
        })
    }

    /// Fill any free seats on `slot` from its queue.
    pub async fn promote(&self, slot: &SlotKey) -> Result<Vec<Booking>, EngineError> {
        let offset = self.offset;
        let slot = slot.clone();
        let promoted = self
            .store
            .commit(self.now(), move |tx| {
                if tx.doc().slot(&slot).is_none() {
                    return Err(EngineError::SlotNotFound(slot));
                }
                promote_in(tx, &slot, offset)
            })
            .await?;
        record_promotions(&promoted);
        Ok(promoted)
    }

    /// Drop every waitlist entry whose slot has started. Returns how many went.
    pub async fn expire_waitlist(&self) -> Result<usize, EngineError> {
        let offset = self.offset;
        let expired = self
            .store
            .commit(self.now(), move |tx| {
                let now = tx.now();
                let stale: Vec<(SlotKey, String)> = tx
                    .doc()
                    .waitlist
                    .iter()
                    .filter(|(key, _)| key.has_started(offset, now))
                    .flat_map(|(key, q)| q.iter().map(move |e| (key.clone(), e.user_id.clone())))
                    .collect();
                for (slot, user_id) in &stale {
                    tx.emit(Event::WaitlistLeft {
                        slot: slot.clone(),
                        user_id: user_id.clone(),
                    })?;
                }
                Ok(stale.len())
            })
            .await?;
        if expired > 0 {
            info!(expired, "expired waitlist entries for started slots");
        }
        Ok(expired)
    }
}
