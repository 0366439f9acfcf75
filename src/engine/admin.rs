use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::waitlist::{promote_in, record_promotions};
use super::{Engine, EngineError};

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidInput("capacity must be at least 1".into()));
    }
    if capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

fn validate_advisor(advisor_id: &str) -> Result<(), EngineError> {
    if advisor_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("advisor_id must not be empty".into()));
    }
    if advisor_id.len() > MAX_ADVISOR_ID_LEN {
        return Err(EngineError::LimitExceeded("advisor_id too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn open_slot(&self, key: &SlotKey, capacity: u32) -> Result<Slot, EngineError> {
        validate_capacity(capacity)?;
        validate_advisor(&key.advisor_id)?;
        let offset = self.offset;
        let owned = key.clone();
        let slot = self
            .store
            .commit(self.now(), move |tx| {
                let key = owned;
                if tx.doc().slot(&key).is_some() {
                    return Err(EngineError::SlotExists(key));
                }
                if key.has_started(offset, tx.now()) {
                    return Err(EngineError::InvalidSlot {
                        slot: key,
                        reason: "slot is in the past",
                    });
                }
                if tx.doc().slots.len() >= MAX_SLOTS {
                    return Err(EngineError::LimitExceeded("too many slots"));
                }
                tx.emit(Event::SlotDefined {
                    key: key.clone(),
                    capacity,
                })?;
                Ok(Slot::new(key, capacity))
            })
            .await?;
        info!(slot = %key, capacity, "slot opened");
        Ok(slot)
    }

    /// Open every slot the schedule describes in one commit. Slots that already
    /// exist or have started are skipped. Returns the keys actually created.
    pub async fn open_schedule(&self, schedule: &SlotSchedule) -> Result<Vec<SlotKey>, EngineError> {
        validate_capacity(schedule.capacity)?;
        if schedule.range.from > schedule.range.to {
            return Err(EngineError::InvalidInput("schedule range is reversed".into()));
        }
        if schedule.range.days() > MAX_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("schedule range too wide"));
        }
        if schedule.times.is_empty() || schedule.advisors.is_empty() {
            return Err(EngineError::InvalidInput("schedule needs at least one time and one advisor".into()));
        }
        if schedule.times.len() > MAX_SCHEDULE_TIMES {
            return Err(EngineError::LimitExceeded("too many schedule times"));
        }
        if schedule.advisors.len() > MAX_SCHEDULE_ADVISORS {
            return Err(EngineError::LimitExceeded("too many schedule advisors"));
        }
        for advisor in &schedule.advisors {
            validate_advisor(advisor)?;
        }
        if schedule.slot_count() > MAX_SLOTS {
            return Err(EngineError::LimitExceeded("schedule describes too many slots"));
        }

        let keys = schedule.keys();
        let requested = keys.len();
        let capacity = schedule.capacity;
        let offset = self.offset;
        let created = self
            .store
            .commit(self.now(), move |tx| {
                let now = tx.now();
                let fresh: Vec<SlotKey> = keys
                    .into_iter()
                    .filter(|k| tx.doc().slot(k).is_none() && !k.has_started(offset, now))
                    .collect();
                if tx.doc().slots.len() + fresh.len() > MAX_SLOTS {
                    return Err(EngineError::LimitExceeded("too many slots"));
                }
                for key in &fresh {
                    tx.emit(Event::SlotDefined {
                        key: key.clone(),
                        capacity,
                    })?;
                }
                Ok(fresh)
            })
            .await?;
        info!(
            created = created.len(),
            skipped = requested - created.len(),
            from = %schedule.range.from,
            to = %schedule.range.to,
            "schedule opened"
        );
        Ok(created)
    }

    /// Change a slot's capacity for future bookings. Raising it promotes waitlisted
    /// users into the new seats; lowering it below what is already booked is refused.
    pub async fn set_capacity(&self, key: &SlotKey, capacity: u32) -> Result<CapacityOutcome, EngineError> {
        validate_capacity(capacity)?;
        let offset = self.offset;
        let owned = key.clone();
        let outcome = self
            .store
            .commit(self.now(), move |tx| {
                let key = owned;
                let Some(slot) = tx.doc().slot(&key) else {
                    return Err(EngineError::SlotNotFound(key));
                };
                if slot.capacity != capacity {
                    tx.emit(Event::SlotDefined {
                        key: key.clone(),
                        capacity,
                    })?;
                }
                let promoted = promote_in(tx, &key, offset)?;
                let slot = tx
                    .doc()
                    .slot(&key)
                    .cloned()
                    .ok_or(EngineError::SlotNotFound(key))?;
                Ok(CapacityOutcome { slot, promoted })
            })
            .await?;
        info!(slot = %key, capacity, booked = outcome.slot.booked_count, "capacity set");
        record_promotions(&outcome.promoted);
        Ok(outcome)
    }
}
