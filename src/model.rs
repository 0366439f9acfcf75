use std::collections::BTreeSet;
use std::fmt;

use chrono::{Datelike, FixedOffset, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// A bookable (date, time-of-day, advisor) unit.
///
/// Ordering is date, then time, then advisor: the order availability
/// listings are returned in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub advisor_id: String,
}

impl SlotKey {
    pub fn new(date: NaiveDate, time: NaiveTime, advisor_id: impl Into<String>) -> Self {
        Self {
            date,
            time,
            advisor_id: advisor_id.into(),
        }
    }

    /// Start instant of the slot, reading date/time as local wall clock at `offset`.
    pub fn starts_at_ms(&self, offset: FixedOffset) -> Ms {
        let local = self.date.and_time(self.time).and_utc().timestamp_millis();
        local - i64::from(offset.local_minus_utc()) * 1000
    }

    pub fn has_started(&self, offset: FixedOffset, now: Ms) -> bool {
        self.starts_at_ms(offset) <= now
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @{}",
            self.date.format("%Y-%m-%d"),
            self.time.format("%H:%M"),
            self.advisor_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub key: SlotKey,
    pub capacity: u32,
    pub booked_count: u32,
}

impl Slot {
    pub fn new(key: SlotKey, capacity: u32) -> Self {
        Self {
            key,
            capacity,
            booked_count: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.booked_count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    /// Tombstone left behind by a reschedule; `to` is the replacement booking.
    Rescheduled { to: Ulid },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: String,
    pub contact: Contact,
    pub topic: Option<String>,
    pub slot: SlotKey,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub rescheduled_from: Option<Ulid>,
    pub via_waitlist: bool,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub slot: SlotKey,
    pub user_id: String,
    pub contact: Contact,
    pub topic: Option<String>,
    pub enqueued_at: Ms,
    /// Document-wide insertion counter; FIFO order within a slot.
    pub seq: u64,
}

/// Low-level state delta. A commit is a list of these; the WAL stores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Creates the slot, or changes its capacity if it exists.
    SlotDefined { key: SlotKey, capacity: u32 },
    /// Inserts or replaces a booking. Seat counts follow the status transition.
    BookingWritten { booking: Booking },
    WaitlistJoined { entry: WaitlistEntry },
    WaitlistLeft { slot: SlotKey, user_id: String },
}

/// One WAL frame: everything a single commit changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub revision: u64,
    pub at: Ms,
    pub events: Vec<Event>,
}

// ── Outbound change records ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Cancelled,
    /// The new booking of a reschedule.
    Rescheduled,
    /// The tombstone a reschedule leaves on the old slot.
    Moved,
    Amended,
    WaitlistJoined,
    /// Withdrawn, expired, or taken off the queue by a booking or promotion.
    WaitlistLeft,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Cancelled => "cancelled",
            ChangeKind::Rescheduled => "rescheduled",
            ChangeKind::Moved => "moved",
            ChangeKind::Amended => "amended",
            ChangeKind::WaitlistJoined => "waitlist_joined",
            ChangeKind::WaitlistLeft => "waitlist_left",
        }
    }
}

/// The thing a change record is about, serialised under its own key
/// (`"booking": {..}` or `"waitlist": {..}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSubject {
    Booking(Booking),
    Waitlist(WaitlistEntry),
}

/// What collaborators receive after a commit is durable. Delivered at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub revision: u64,
    pub kind: ChangeKind,
    #[serde(flatten)]
    pub subject: ChangeSubject,
    pub at: Ms,
}

impl ChangeRecord {
    pub fn booking(&self) -> Option<&Booking> {
        match &self.subject {
            ChangeSubject::Booking(b) => Some(b),
            ChangeSubject::Waitlist(_) => None,
        }
    }

    pub fn waitlist_entry(&self) -> Option<&WaitlistEntry> {
        match &self.subject {
            ChangeSubject::Waitlist(e) => Some(e),
            ChangeSubject::Booking(_) => None,
        }
    }

    /// Booking id or waitlist entry id.
    pub fn subject_id(&self) -> Ulid {
        match &self.subject {
            ChangeSubject::Booking(b) => b.id,
            ChangeSubject::Waitlist(e) => e.id,
        }
    }

    pub fn slot(&self) -> &SlotKey {
        match &self.subject {
            ChangeSubject::Booking(b) => &b.slot,
            ChangeSubject::Waitlist(e) => &e.slot,
        }
    }

    pub fn advisor_id(&self) -> &str {
        &self.slot().advisor_id
    }
}

/// Stored form of a user id: trimmed and lowercased, so `Asha` and `asha`
/// are one user for the one-active-booking rule, the waitlist and lookups.
pub fn canonical_user_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

// ── Requests and outcomes ────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFull {
    #[default]
    Waitlist,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookRequest {
    pub user_id: String,
    pub contact: Contact,
    pub topic: Option<String>,
    pub slot: SlotKey,
    pub on_full: OnFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitlistTicket {
    pub entry_id: Ulid,
    pub slot: SlotKey,
    pub user_id: String,
    /// 1-based position in the slot's queue.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookOutcome {
    Confirmed(Booking),
    Waitlisted(WaitlistTicket),
    /// The slot was full and the caller asked not to be queued.
    Full(SlotKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub cancelled: Booking,
    pub promoted: Vec<Booking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescheduleOutcome {
    /// The replacement booking; the old one is now a tombstone pointing at it.
    pub booking: Booking,
    /// Waitlisted users who took the seat that was freed.
    pub promoted: Vec<Booking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityOutcome {
    pub slot: Slot,
    pub promoted: Vec<Booking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAvailability {
    pub key: SlotKey,
    pub capacity: u32,
    pub booked: u32,
    pub remaining: u32,
    pub waitlisted: usize,
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        debug_assert!(from <= to, "DateRange from must not be after to");
        Self { from, to }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { from: date, to: date }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }

    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let to = self.to;
        self.from.iter_days().take_while(move |d| *d <= to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupCriteria {
    pub booking_id: Option<Ulid>,
    /// Compared against stored ids; pass through `canonicalized` first.
    pub user_id: Option<String>,
    /// Case-insensitive match on `contact.name`.
    pub contact_name: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub advisor_id: Option<String>,
    /// `None` matches every status; `Some(true)` only confirmed bookings.
    pub confirmed_only: Option<bool>,
}

impl LookupCriteria {
    /// Bring `user_id` into stored form.
    pub fn canonicalized(mut self) -> Self {
        self.user_id = self.user_id.map(|u| canonical_user_id(&u));
        self
    }

    pub fn matches(&self, b: &Booking) -> bool {
        if let Some(id) = self.booking_id
            && b.id != id {
                return false;
            }
        if let Some(ref u) = self.user_id
            && &b.user_id != u {
                return false;
            }
        if let Some(ref n) = self.contact_name {
            match &b.contact.name {
                Some(name) if name.eq_ignore_ascii_case(n) => {}
                _ => return false,
            }
        }
        if let Some(d) = self.date
            && b.slot.date != d {
                return false;
            }
        if let Some(t) = self.time
            && b.slot.time != t {
                return false;
            }
        if let Some(ref a) = self.advisor_id
            && &b.slot.advisor_id != a {
                return false;
            }
        if self.confirmed_only == Some(true) && !b.is_confirmed() {
            return false;
        }
        true
    }
}

/// Result of looking up an opaque code a user was handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeLookup {
    Booking(Booking),
    Waitlist(WaitlistTicket),
}

/// Bulk slot creation: every `time` on every date in range, for every advisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSchedule {
    pub range: DateRange,
    pub times: Vec<NaiveTime>,
    pub advisors: Vec<String>,
    pub capacity: u32,
    pub weekdays_only: bool,
}

impl SlotSchedule {
    /// How many keys `keys` would produce, without building them.
    pub fn slot_count(&self) -> usize {
        let times: BTreeSet<&NaiveTime> = self.times.iter().collect();
        let advisors: BTreeSet<&String> = self.advisors.iter().collect();
        let dates = self
            .range
            .dates()
            .filter(|d| !self.weekdays_only || !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
            .count();
        dates.saturating_mul(times.len()).saturating_mul(advisors.len())
    }

    /// Expand to slot keys in listing order.
    pub fn keys(&self) -> Vec<SlotKey> {
        let mut times = self.times.clone();
        times.sort();
        times.dedup();
        let mut advisors = self.advisors.clone();
        advisors.sort();
        advisors.dedup();

        let mut keys = Vec::new();
        for date in self.range.dates() {
            if self.weekdays_only && matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                continue;
            }
            for time in &times {
                for advisor in &advisors {
                    keys.push(SlotKey::new(date, *time, advisor.clone()));
                }
            }
        }
        keys
    }
}

/// Read-only admin listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminView {
    pub revision: u64,
    pub slots: Vec<SlotAvailability>,
    pub bookings: Vec<Booking>,
    pub waitlist: Vec<WaitlistEntry>,
}
