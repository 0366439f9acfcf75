use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.snapshot()
            .booking(&id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// Bookings matching every set criterion, ordered by slot then creation time.
    pub fn lookup(&self, criteria: &LookupCriteria) -> Vec<Booking> {
        let criteria = criteria.clone().canonicalized();
        let doc = self.snapshot();
        let mut found: Vec<Booking> = match criteria.booking_id {
            Some(id) => doc
                .booking(&id)
                .filter(|b| criteria.matches(b))
                .cloned()
                .into_iter()
                .collect(),
            None => doc
                .bookings
                .values()
                .filter(|b| criteria.matches(b))
                .cloned()
                .collect(),
        };
        found.sort_by(|a, b| a.slot.cmp(&b.slot).then(a.created_at.cmp(&b.created_at)));
        found
    }

    /// Resolve a code a user was handed: a booking id, or failing that a waitlist ticket.
    pub fn lookup_code(&self, code: Ulid) -> Result<CodeLookup, EngineError> {
        if let Some(b) = self.snapshot().booking(&code) {
            return Ok(CodeLookup::Booking(b.clone()));
        }
        match self.waitlist_ticket(code) {
            Ok(ticket) => Ok(CodeLookup::Waitlist(ticket)),
            Err(EngineError::WaitlistEntryNotFound(_)) => Err(EngineError::BookingNotFound(code)),
            Err(e) => Err(e),
        }
    }

    pub fn admin_view(&self) -> AdminView {
        let doc = self.snapshot();
        AdminView {
            revision: doc.revision,
            slots: doc
                .slots
                .values()
                .map(|s| SlotAvailability {
                    key: s.key.clone(),
                    capacity: s.capacity,
                    booked: s.booked_count,
                    remaining: s.remaining(),
                    waitlisted: doc.waitlist_len(&s.key),
                })
                .collect(),
            bookings: doc.bookings.values().cloned().collect(),
            waitlist: doc.waitlist.values().flatten().cloned().collect(),
        }
    }
}
