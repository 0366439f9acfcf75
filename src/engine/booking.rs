use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::waitlist::{enqueue_in, promote_in, record_promotions};
use super::{bookable_slot, Engine, EngineError};

/// Length and presence checks on who is booking.
pub(super) fn validate_party(
    user_id: &str,
    contact: &Contact,
    topic: Option<&str>,
) -> Result<(), EngineError> {
    if user_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("user_id must not be empty".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user_id too long"));
    }
    if topic.is_some_and(|t| t.len() > MAX_TOPIC_LEN) {
        return Err(EngineError::LimitExceeded("topic too long"));
    }
    let fields = [&contact.name, &contact.email, &contact.phone];
    if fields
        .iter()
        .any(|f| f.as_ref().is_some_and(|v| v.len() > MAX_CONTACT_FIELD_LEN))
    {
        return Err(EngineError::LimitExceeded("contact field too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn book(&self, mut req: BookRequest) -> Result<BookOutcome, EngineError> {
        req.user_id = canonical_user_id(&req.user_id);
        validate_party(&req.user_id, &req.contact, req.topic.as_deref())?;
        let offset = self.offset;
        let user_id = req.user_id.clone();
        let outcome = self
            .store
            .commit(self.now(), move |tx| {
                let free = bookable_slot(tx.doc(), &req.slot, offset, tx.now())?.remaining();
                if let Some(active) = tx.doc().active_booking(&req.user_id) {
                    return Err(EngineError::DuplicateActiveBooking {
                        user_id: req.user_id.clone(),
                        booking_id: active.id,
                    });
                }
                if free == 0 {
                    return match req.on_full {
                        OnFull::Reject => Ok(BookOutcome::Full(req.slot.clone())),
                        OnFull::Waitlist => enqueue_in(
                            tx,
                            &req.slot,
                            &req.user_id,
                            &req.contact,
                            req.topic.as_deref(),
                        )
                        .map(BookOutcome::Waitlisted),
                    };
                }

                // A queued user who gets a seat directly leaves the queue.
                if tx.doc().waitlist_entry(&req.slot, &req.user_id).is_some() {
                    tx.emit(Event::WaitlistLeft {
                        slot: req.slot.clone(),
                        user_id: req.user_id.clone(),
                    })?;
                }
                let now = tx.now();
                let booking = Booking {
                    id: Ulid::new(),
                    user_id: req.user_id.clone(),
                    contact: req.contact.clone(),
                    topic: req.topic.clone(),
                    slot: req.slot.clone(),
                    status: BookingStatus::Confirmed,
                    created_at: now,
                    updated_at: now,
                    rescheduled_from: None,
                    via_waitlist: false,
                };
                tx.emit(Event::BookingWritten {
                    booking: booking.clone(),
                })?;
                Ok(BookOutcome::Confirmed(booking))
            })
            .await?;

        let label = match &outcome {
            BookOutcome::Confirmed(b) => {
                info!(booking_id = %b.id, user_id = %b.user_id, slot = %b.slot, "booking confirmed");
                "confirmed"
            }
            BookOutcome::Waitlisted(t) => {
                info!(entry_id = %t.entry_id, user_id = %t.user_id, slot = %t.slot, position = t.position, "slot full, waitlisted");
                "waitlisted"
            }
            BookOutcome::Full(slot) => {
                info!(%user_id, %slot, "slot full, not queued");
                "full"
            }
        };
        metrics::counter!(observability::BOOKING_OUTCOMES_TOTAL, "outcome" => label).increment(1);
        Ok(outcome)
    }

    /// Move a confirmed booking to `new_slot`. The old booking is kept as a
    /// tombstone and its seat goes to the old slot's queue, all in one commit.
    pub async fn reschedule(
        &self,
        booking_id: Ulid,
        new_slot: &SlotKey,
    ) -> Result<RescheduleOutcome, EngineError> {
        let offset = self.offset;
        let new_slot = new_slot.clone();
        let outcome = self
            .store
            .commit(self.now(), move |tx| {
                let old = tx
                    .doc()
                    .booking(&booking_id)
                    .cloned()
                    .ok_or(EngineError::BookingNotFound(booking_id))?;
                if !old.is_confirmed() {
                    return Err(EngineError::BookingNotActive(booking_id));
                }
                if old.slot == new_slot {
                    return Err(EngineError::SameSlot(booking_id));
                }
                let free = bookable_slot(tx.doc(), &new_slot, offset, tx.now())?.remaining();
                if free == 0 {
                    return Err(EngineError::SlotFull(new_slot.clone()));
                }

                let now = tx.now();
                let new_id = Ulid::new();
                let mut tombstone = old.clone();
                tombstone.status = BookingStatus::Rescheduled { to: new_id };
                tombstone.updated_at = now;
                tx.emit(Event::BookingWritten { booking: tombstone })?;

                if tx.doc().waitlist_entry(&new_slot, &old.user_id).is_some() {
                    tx.emit(Event::WaitlistLeft {
                        slot: new_slot.clone(),
                        user_id: old.user_id.clone(),
                    })?;
                }
                let booking = Booking {
                    id: new_id,
                    user_id: old.user_id.clone(),
                    contact: old.contact.clone(),
                    topic: old.topic.clone(),
                    slot: new_slot,
                    status: BookingStatus::Confirmed,
                    created_at: now,
                    updated_at: now,
                    rescheduled_from: Some(old.id),
                    via_waitlist: false,
                };
                tx.emit(Event::BookingWritten {
                    booking: booking.clone(),
                })?;
                let promoted = promote_in(tx, &old.slot, offset)?;
                Ok(RescheduleOutcome { booking, promoted })
            })
            .await?;

        info!(
            from = %booking_id,
            to = %outcome.booking.id,
            slot = %outcome.booking.slot,
            "booking rescheduled"
        );
        record_promotions(&outcome.promoted);
        Ok(outcome)
    }

    pub async fn cancel(&self, booking_id: Ulid) -> Result<CancelOutcome, EngineError> {
        let offset = self.offset;
        let outcome = self
            .store
            .commit(self.now(), move |tx| {
                let mut booking = tx
                    .doc()
                    .booking(&booking_id)
                    .cloned()
                    .ok_or(EngineError::BookingNotFound(booking_id))?;
                if !booking.is_confirmed() {
                    return Err(EngineError::BookingNotActive(booking_id));
                }
                booking.status = BookingStatus::Cancelled;
                booking.updated_at = tx.now();
                tx.emit(Event::BookingWritten {
                    booking: booking.clone(),
                })?;
                let promoted = promote_in(tx, &booking.slot, offset)?;
                Ok(CancelOutcome {
                    cancelled: booking,
                    promoted,
                })
            })
            .await?;

        info!(booking_id = %booking_id, slot = %outcome.cancelled.slot, "booking cancelled");
        record_promotions(&outcome.promoted);
        Ok(outcome)
    }

    /// Replace the contact details and/or topic of a confirmed booking.
    pub async fn amend(
        &self,
        booking_id: Ulid,
        contact: Option<Contact>,
        topic: Option<String>,
    ) -> Result<Booking, EngineError> {
        if contact.is_none() && topic.is_none() {
            return Err(EngineError::InvalidInput("nothing to amend".into()));
        }
        self.store
            .commit(self.now(), move |tx| {
                let old = tx
                    .doc()
                    .booking(&booking_id)
                    .cloned()
                    .ok_or(EngineError::BookingNotFound(booking_id))?;
                if !old.is_confirmed() {
                    return Err(EngineError::BookingNotActive(booking_id));
                }
                let mut booking = old.clone();
                if let Some(c) = contact {
                    booking.contact = c;
                }
                if topic.is_some() {
                    booking.topic = topic;
                }
                validate_party(&booking.user_id, &booking.contact, booking.topic.as_deref())?;
                if booking == old {
                    return Ok(old);
                }
                booking.updated_at = tx.now();
                tx.emit(Event::BookingWritten {
                    booking: booking.clone(),
                })?;
                Ok(booking)
            })
            .await
    }
}
