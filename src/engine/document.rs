use std::collections::{BTreeMap, HashMap, VecDeque};

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// The canonical state: every slot, booking and waitlist entry at one revision.
///
/// Only the store writer publishes new `Document`s; everything else works on
/// `Arc` snapshots or on a private copy inside a [`Tx`].
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub revision: u64,
    pub slots: BTreeMap<SlotKey, Slot>,
    pub bookings: BTreeMap<Ulid, Booking>,
    pub waitlist: BTreeMap<SlotKey, VecDeque<WaitlistEntry>>,
    /// user_id → their single confirmed booking.
    active: HashMap<String, Ulid>,
    next_seq: u64,
}

impl Document {
    pub fn slot(&self, key: &SlotKey) -> Option<&Slot> {
        self.slots.get(key)
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.get(id)
    }

    pub fn active_booking(&self, user_id: &str) -> Option<&Booking> {
        self.active.get(user_id).and_then(|id| self.bookings.get(id))
    }

    pub fn queue(&self, key: &SlotKey) -> impl Iterator<Item = &WaitlistEntry> {
        self.waitlist.get(key).into_iter().flatten()
    }

    pub fn waitlist_len(&self, key: &SlotKey) -> usize {
        self.waitlist.get(key).map_or(0, |q| q.len())
    }

    pub fn waitlist_entry(&self, key: &SlotKey, user_id: &str) -> Option<&WaitlistEntry> {
        self.queue(key).find(|e| e.user_id == user_id)
    }

    /// Entry by id with its 1-based position in the slot's queue.
    pub fn find_waitlist_entry(&self, id: &Ulid) -> Option<(&WaitlistEntry, usize)> {
        self.waitlist.values().find_map(|q| {
            q.iter()
                .position(|e| e.id == *id)
                .map(|pos| (&q[pos], pos + 1))
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Apply an event with no checks. Used by replay and, after validation, by [`Tx`].
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::SlotDefined { key, capacity } => {
                self.slots
                    .entry(key.clone())
                    .and_modify(|s| s.capacity = *capacity)
                    .or_insert_with(|| Slot::new(key.clone(), *capacity));
            }
            Event::BookingWritten { booking } => {
                if let Some(prev) = self.bookings.get(&booking.id)
                    && prev.is_confirmed() {
                        if let Some(slot) = self.slots.get_mut(&prev.slot) {
                            slot.booked_count = slot.booked_count.saturating_sub(1);
                        }
                        if self.active.get(&prev.user_id) == Some(&prev.id) {
                            self.active.remove(&prev.user_id);
                        }
                    }
                if booking.is_confirmed() {
                    if let Some(slot) = self.slots.get_mut(&booking.slot) {
                        slot.booked_count += 1;
                    }
                    self.active.insert(booking.user_id.clone(), booking.id);
                }
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::WaitlistJoined { entry } => {
                self.next_seq = self.next_seq.max(entry.seq + 1);
                self.waitlist
                    .entry(entry.slot.clone())
                    .or_default()
                    .push_back(entry.clone());
            }
            Event::WaitlistLeft { slot, user_id } => {
                if let Some(q) = self.waitlist.get_mut(slot) {
                    q.retain(|e| &e.user_id != user_id);
                    if q.is_empty() {
                        self.waitlist.remove(slot);
                    }
                }
            }
        }
    }

    /// Events that rebuild this document from empty. Tombstoned and cancelled
    /// bookings are kept; waitlists keep their queue order.
    pub fn to_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.slots.len() + self.bookings.len());
        for slot in self.slots.values() {
            events.push(Event::SlotDefined {
                key: slot.key.clone(),
                capacity: slot.capacity,
            });
        }
        for booking in self.bookings.values() {
            events.push(Event::BookingWritten {
                booking: booking.clone(),
            });
        }
        for entry in self.waitlist.values().flatten() {
            events.push(Event::WaitlistJoined {
                entry: entry.clone(),
            });
        }
        events
    }

    /// Full consistency scan. Cheap enough for replay and tests, not run per commit.
    pub fn verify(&self) -> Result<(), String> {
        let mut confirmed_per_slot: HashMap<&SlotKey, u32> = HashMap::new();
        let mut confirmed_per_user: HashMap<&str, u32> = HashMap::new();
        for b in self.bookings.values().filter(|b| b.is_confirmed()) {
            if !self.slots.contains_key(&b.slot) {
                return Err(format!("booking {} references unknown slot {}", b.id, b.slot));
            }
            *confirmed_per_slot.entry(&b.slot).or_default() += 1;
            *confirmed_per_user.entry(b.user_id.as_str()).or_default() += 1;
        }
        for slot in self.slots.values() {
            let counted = confirmed_per_slot.get(&slot.key).copied().unwrap_or(0);
            if slot.booked_count != counted {
                return Err(format!(
                    "slot {} booked_count {} but {} confirmed bookings",
                    slot.key, slot.booked_count, counted
                ));
            }
            if slot.booked_count > slot.capacity {
                return Err(format!(
                    "slot {} over capacity: {}/{}",
                    slot.key, slot.booked_count, slot.capacity
                ));
            }
        }
        if let Some((user, n)) = confirmed_per_user.iter().find(|(_, n)| **n > 1) {
            return Err(format!("user {user} has {n} confirmed bookings"));
        }
        for (key, q) in &self.waitlist {
            let mut users: Vec<&str> = q.iter().map(|e| e.user_id.as_str()).collect();
            users.sort_unstable();
            if users.windows(2).any(|w| w[0] == w[1]) {
                return Err(format!("duplicate waitlist entry on {key}"));
            }
            if q.iter().zip(q.iter().skip(1)).any(|(a, b)| a.seq >= b.seq) {
                return Err(format!("waitlist on {key} out of FIFO order"));
            }
        }
        Ok(())
    }
}

/// A staged mutation: a private copy of the head document plus the events
/// applied to it. Every write goes through [`Tx::emit`], which refuses events
/// that would break an invariant.
pub struct Tx {
    doc: Document,
    events: Vec<Event>,
    changes: Vec<(ChangeKind, ChangeSubject)>,
    now: Ms,
}

impl Tx {
    pub(super) fn new(doc: Document, now: Ms) -> Self {
        Self {
            doc,
            events: Vec::new(),
            changes: Vec::new(),
            now,
        }
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn now(&self) -> Ms {
        self.now
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(super) fn emit(&mut self, event: Event) -> Result<(), EngineError> {
        match &event {
            Event::SlotDefined { key, capacity } => {
                if *capacity == 0 {
                    return Err(EngineError::InvalidInput("capacity must be at least 1".into()));
                }
                if let Some(slot) = self.doc.slot(key)
                    && slot.booked_count > *capacity {
                        return Err(EngineError::CapacityBelowBooked {
                            slot: key.clone(),
                            booked: slot.booked_count,
                            requested: *capacity,
                        });
                    }
            }
            Event::BookingWritten { booking } => {
                let Some(slot) = self.doc.slot(&booking.slot) else {
                    return Err(EngineError::Invariant(format!(
                        "booking {} written to unknown slot {}",
                        booking.id, booking.slot
                    )));
                };
                let prev = self.doc.booking(&booking.id);
                if booking.is_confirmed() {
                    if let Some(active) = self.doc.active_booking(&booking.user_id)
                        && active.id != booking.id {
                            return Err(EngineError::Invariant(format!(
                                "user {} would hold two confirmed bookings",
                                booking.user_id
                            )));
                        }
                    let already_here = prev.is_some_and(|p| p.is_confirmed() && p.slot == booking.slot);
                    if !already_here && slot.remaining() == 0 {
                        return Err(EngineError::Invariant(format!(
                            "slot {} would exceed capacity {}",
                            slot.key, slot.capacity
                        )));
                    }
                }
                let kind = match (prev.map(|p| p.status), booking.status) {
                    (None, BookingStatus::Confirmed) if booking.rescheduled_from.is_some() => {
                        Some(ChangeKind::Rescheduled)
                    }
                    (None, BookingStatus::Confirmed) => Some(ChangeKind::Created),
                    (Some(BookingStatus::Confirmed), BookingStatus::Cancelled) => Some(ChangeKind::Cancelled),
                    (Some(BookingStatus::Confirmed), BookingStatus::Rescheduled { .. }) => {
                        Some(ChangeKind::Moved)
                    }
                    (Some(BookingStatus::Confirmed), BookingStatus::Confirmed) => Some(ChangeKind::Amended),
                    _ => None,
                };
                if let Some(kind) = kind {
                    self.changes.push((kind, ChangeSubject::Booking(booking.clone())));
                }
            }
            Event::WaitlistJoined { entry } => {
                if self.doc.waitlist_entry(&entry.slot, &entry.user_id).is_some() {
                    return Err(EngineError::AlreadyWaitlisted {
                        user_id: entry.user_id.clone(),
                        slot: entry.slot.clone(),
                    });
                }
                self.changes
                    .push((ChangeKind::WaitlistJoined, ChangeSubject::Waitlist(entry.clone())));
            }
            Event::WaitlistLeft { slot, user_id } => {
                if let Some(entry) = self.doc.waitlist_entry(slot, user_id) {
                    self.changes
                        .push((ChangeKind::WaitlistLeft, ChangeSubject::Waitlist(entry.clone())));
                }
            }
        }
        self.doc.apply(&event);
        self.events.push(event);
        Ok(())
    }

    pub(super) fn into_parts(self) -> (Document, Vec<Event>, Vec<(ChangeKind, ChangeSubject)>) {
        (self.doc, self.events, self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn key(hour: u32) -> SlotKey {
        SlotKey::new(
            NaiveDate::from_ymd_opt(2026, 1, 7).unwrap(),
            NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            "adv-1",
        )
    }

    fn confirmed(user: &str, slot: SlotKey) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: user.into(),
            contact: Contact::default(),
            topic: None,
            slot,
            status: BookingStatus::Confirmed,
            created_at: 0,
            updated_at: 0,
            rescheduled_from: None,
            via_waitlist: false,
        }
    }

    fn entry(user: &str, slot: SlotKey, seq: u64) -> WaitlistEntry {
        WaitlistEntry {
            id: Ulid::new(),
            slot,
            user_id: user.into(),
            contact: Contact::default(),
            topic: None,
            enqueued_at: 0,
            seq,
        }
    }

    #[test]
    fn booking_status_transitions_move_seat_counts() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 2 });
        let b = confirmed("u1", key(14));
        doc.apply(&Event::BookingWritten { booking: b.clone() });
        assert_eq!(doc.slot(&key(14)).unwrap().booked_count, 1);
        assert_eq!(doc.active_booking("u1").map(|b| b.id), Some(b.id));

        let mut cancelled = b.clone();
        cancelled.status = BookingStatus::Cancelled;
        doc.apply(&Event::BookingWritten { booking: cancelled });
        assert_eq!(doc.slot(&key(14)).unwrap().booked_count, 0);
        assert!(doc.active_booking("u1").is_none());
        assert_eq!(doc.bookings.len(), 1, "bookings are never deleted");
        doc.verify().unwrap();
    }

    #[test]
    fn slot_redefinition_keeps_booked_count() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 1 });
        doc.apply(&Event::BookingWritten { booking: confirmed("u1", key(14)) });
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 3 });
        let slot = doc.slot(&key(14)).unwrap();
        assert_eq!((slot.capacity, slot.booked_count), (3, 1));
    }

    #[test]
    fn waitlist_left_drops_empty_queue() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 1 });
        doc.apply(&Event::WaitlistJoined { entry: entry("a", key(14), 0) });
        doc.apply(&Event::WaitlistJoined { entry: entry("b", key(14), 1) });
        assert_eq!(doc.next_seq(), 2);
        let (_, pos) = doc
            .find_waitlist_entry(&doc.waitlist_entry(&key(14), "b").unwrap().id)
            .unwrap();
        assert_eq!(pos, 2);

        doc.apply(&Event::WaitlistLeft { slot: key(14), user_id: "a".into() });
        doc.apply(&Event::WaitlistLeft { slot: key(14), user_id: "b".into() });
        assert!(doc.waitlist.is_empty());
        // Leaving twice is harmless.
        doc.apply(&Event::WaitlistLeft { slot: key(14), user_id: "b".into() });
    }

    #[test]
    fn to_events_rebuilds_identical_state() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 1 });
        doc.apply(&Event::SlotDefined { key: key(15), capacity: 2 });
        let b = confirmed("u1", key(14));
        doc.apply(&Event::BookingWritten { booking: b.clone() });
        let mut tomb = confirmed("u2", key(15));
        tomb.status = BookingStatus::Rescheduled { to: Ulid::new() };
        doc.apply(&Event::BookingWritten { booking: tomb });
        doc.apply(&Event::WaitlistJoined { entry: entry("w1", key(14), 4) });
        doc.apply(&Event::WaitlistJoined { entry: entry("w2", key(14), 9) });

        let mut rebuilt = Document::default();
        for e in doc.to_events() {
            rebuilt.apply(&e);
        }
        assert_eq!(rebuilt.slots, doc.slots);
        assert_eq!(rebuilt.bookings, doc.bookings);
        assert_eq!(rebuilt.waitlist, doc.waitlist);
        assert_eq!(rebuilt.active_booking("u1").map(|b| b.id), Some(b.id));
        assert_eq!(rebuilt.next_seq(), 10);
        rebuilt.verify().unwrap();
    }

    #[test]
    fn verify_catches_over_capacity() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 1 });
        doc.apply(&Event::BookingWritten { booking: confirmed("u1", key(14)) });
        doc.apply(&Event::BookingWritten { booking: confirmed("u2", key(14)) });
        assert!(doc.verify().is_err());
    }

    #[test]
    fn tx_refuses_second_confirmed_booking_for_user() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 1 });
        doc.apply(&Event::SlotDefined { key: key(15), capacity: 1 });
        doc.apply(&Event::BookingWritten { booking: confirmed("u1", key(14)) });

        let mut tx = Tx::new(doc, 0);
        let err = tx
            .emit(Event::BookingWritten { booking: confirmed("u1", key(15)) })
            .unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
        assert!(tx.is_empty());
    }

    #[test]
    fn tx_refuses_full_slot_and_duplicate_waitlist() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 1 });
        doc.apply(&Event::BookingWritten { booking: confirmed("u1", key(14)) });

        let mut tx = Tx::new(doc, 0);
        assert!(matches!(
            tx.emit(Event::BookingWritten { booking: confirmed("u2", key(14)) }),
            Err(EngineError::Invariant(_))
        ));
        tx.emit(Event::WaitlistJoined { entry: entry("u2", key(14), 0) }).unwrap();
        assert!(matches!(
            tx.emit(Event::WaitlistJoined { entry: entry("u2", key(14), 1) }),
            Err(EngineError::AlreadyWaitlisted { .. })
        ));
        assert!(matches!(
            tx.emit(Event::SlotDefined { key: key(14), capacity: 0 }),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn tx_derives_change_kinds() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 2 });
        let mut tx = Tx::new(doc, 0);

        let b = confirmed("u1", key(14));
        tx.emit(Event::BookingWritten { booking: b.clone() }).unwrap();
        let mut amended = b.clone();
        amended.topic = Some("SIP/Mandates".into());
        tx.emit(Event::BookingWritten { booking: amended.clone() }).unwrap();
        let mut cancelled = amended;
        cancelled.status = BookingStatus::Cancelled;
        tx.emit(Event::BookingWritten { booking: cancelled }).unwrap();

        let (doc, events, changes) = tx.into_parts();
        assert_eq!(events.len(), 3);
        let kinds: Vec<ChangeKind> = changes.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![ChangeKind::Created, ChangeKind::Amended, ChangeKind::Cancelled]);
        assert_eq!(doc.slot(&key(14)).unwrap().booked_count, 0);
    }

    #[test]
    fn tx_reports_tombstones_and_queue_moves() {
        let mut doc = Document::default();
        doc.apply(&Event::SlotDefined { key: key(14), capacity: 1 });
        doc.apply(&Event::SlotDefined { key: key(15), capacity: 1 });
        let old = confirmed("u1", key(14));
        doc.apply(&Event::BookingWritten { booking: old.clone() });
        let mut tx = Tx::new(doc, 0);

        let mut moved = confirmed("u1", key(15));
        moved.rescheduled_from = Some(old.id);
        let mut tomb = old.clone();
        tomb.status = BookingStatus::Rescheduled { to: moved.id };
        tx.emit(Event::BookingWritten { booking: tomb }).unwrap();
        tx.emit(Event::BookingWritten { booking: moved }).unwrap();
        tx.emit(Event::WaitlistJoined { entry: entry("w1", key(15), 0) }).unwrap();
        tx.emit(Event::WaitlistLeft { slot: key(15), user_id: "w1".into() }).unwrap();
        // Leaving a queue you are not on reports nothing.
        tx.emit(Event::WaitlistLeft { slot: key(15), user_id: "w1".into() }).unwrap();

        let (_, _, changes) = tx.into_parts();
        let kinds: Vec<ChangeKind> = changes.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::Moved,
                ChangeKind::Rescheduled,
                ChangeKind::WaitlistJoined,
                ChangeKind::WaitlistLeft,
            ]
        );
        match &changes[0].1 {
            ChangeSubject::Booking(b) => assert_eq!((b.id, &b.slot), (old.id, &key(14))),
            other => panic!("expected booking subject, got {other:?}"),
        }
    }
}
