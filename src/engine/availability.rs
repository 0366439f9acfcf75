use chrono::{FixedOffset, NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::{Document, Engine, EngineError};

fn describe(doc: &Document, slot: &Slot) -> SlotAvailability {
    SlotAvailability {
        key: slot.key.clone(),
        capacity: slot.capacity,
        booked: slot.booked_count,
        remaining: slot.remaining(),
        waitlisted: doc.waitlist_len(&slot.key),
    }
}

/// Slots whose date falls in `range`, in key order.
fn slots_in<'a>(doc: &'a Document, range: &DateRange) -> impl Iterator<Item = &'a Slot> + 'a {
    let start = SlotKey::new(range.from, NaiveTime::default(), String::new());
    let to = range.to;
    doc.slots
        .range(start..)
        .map(|(_, slot)| slot)
        .take_while(move |slot| slot.key.date <= to)
}

fn advisor_matches(slot: &Slot, advisor: Option<&str>) -> bool {
    advisor.is_none_or(|a| slot.key.advisor_id == a)
}

pub fn remaining(doc: &Document, key: &SlotKey) -> Result<u32, EngineError> {
    doc.slot(key)
        .map(Slot::remaining)
        .ok_or_else(|| EngineError::SlotNotFound(key.clone()))
}

/// Future slots in `range` with at least one free seat.
pub fn list_available(
    doc: &Document,
    range: &DateRange,
    advisor: Option<&str>,
    offset: FixedOffset,
    now: Ms,
) -> Vec<SlotAvailability> {
    slots_in(doc, range)
        .filter(|s| s.remaining() > 0)
        .filter(|s| advisor_matches(s, advisor))
        .filter(|s| !s.key.has_started(offset, now))
        .map(|s| describe(doc, s))
        .collect()
}

/// Every slot in `range`, full or not, with its waitlist length.
pub fn slot_overview(doc: &Document, range: &DateRange, advisor: Option<&str>) -> Vec<SlotAvailability> {
    slots_in(doc, range)
        .filter(|s| advisor_matches(s, advisor))
        .map(|s| describe(doc, s))
        .collect()
}

/// Dates that still have an open future slot.
pub fn available_dates(
    doc: &Document,
    advisor: Option<&str>,
    offset: FixedOffset,
    now: Ms,
) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = doc
        .slots
        .values()
        .filter(|s| s.remaining() > 0 && advisor_matches(s, advisor))
        .filter(|s| !s.key.has_started(offset, now))
        .map(|s| s.key.date)
        .collect();
    dates.dedup();
    dates
}

fn check_range(range: &DateRange) -> Result<(), EngineError> {
    if range.from > range.to {
        return Err(EngineError::InvalidInput(format!(
            "date range {} .. {} is reversed",
            range.from, range.to
        )));
    }
    if range.days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

impl Engine {
    pub fn available(&self, key: &SlotKey) -> Result<u32, EngineError> {
        remaining(&self.snapshot(), key)
    }

    pub fn check_availability(
        &self,
        range: &DateRange,
        advisor: Option<&str>,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        check_range(range)?;
        Ok(list_available(&self.snapshot(), range, advisor, self.offset, self.now()))
    }

    pub fn slot_overview(
        &self,
        range: &DateRange,
        advisor: Option<&str>,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        check_range(range)?;
        Ok(slot_overview(&self.snapshot(), range, advisor))
    }

    pub fn available_dates(&self, advisor: Option<&str>) -> Vec<NaiveDate> {
        available_dates(&self.snapshot(), advisor, self.offset, self.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn key(d: &str, hour: u32, advisor: &str) -> SlotKey {
        SlotKey::new(date(d), NaiveTime::from_hms_opt(hour, 0, 0).unwrap(), advisor)
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn doc() -> Document {
        let mut doc = Document::default();
        for k in [
            key("2026-01-06", 14, "a"),
            key("2026-01-07", 14, "a"),
            key("2026-01-07", 14, "b"),
            key("2026-01-07", 15, "a"),
            key("2026-01-09", 14, "a"),
        ] {
            doc.apply(&Event::SlotDefined { key: k, capacity: 1 });
        }
        doc.apply(&Event::BookingWritten {
            booking: Booking {
                id: ulid::Ulid::new(),
                user_id: "u1".into(),
                contact: Contact::default(),
                topic: None,
                slot: key("2026-01-07", 15, "a"),
                status: BookingStatus::Confirmed,
                created_at: 0,
                updated_at: 0,
                rescheduled_from: None,
                via_waitlist: false,
            },
        });
        doc
    }

    #[test]
    fn list_available_filters_full_and_orders_by_key() {
        let doc = doc();
        let range = DateRange::new(date("2026-01-07"), date("2026-01-08"));
        let got: Vec<SlotKey> = list_available(&doc, &range, None, utc(), 0)
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(got, vec![key("2026-01-07", 14, "a"), key("2026-01-07", 14, "b")]);
    }

    #[test]
    fn list_available_respects_advisor_filter_and_clock() {
        let doc = doc();
        let range = DateRange::new(date("2026-01-06"), date("2026-01-09"));
        let now = key("2026-01-07", 14, "a").starts_at_ms(utc());
        let got: Vec<SlotKey> = list_available(&doc, &range, Some("a"), utc(), now)
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(got, vec![key("2026-01-09", 14, "a")]);
    }

    #[test]
    fn overview_includes_full_slots() {
        let doc = doc();
        let overview = slot_overview(&doc, &DateRange::single(date("2026-01-07")), Some("a"));
        assert_eq!(overview.len(), 2);
        assert_eq!(overview[1].remaining, 0);
        assert_eq!(overview[1].booked, 1);
    }

    #[test]
    fn available_dates_are_distinct_and_future() {
        let doc = doc();
        let now = key("2026-01-06", 14, "a").starts_at_ms(utc()) + 1;
        assert_eq!(
            available_dates(&doc, None, utc(), now),
            vec![date("2026-01-07"), date("2026-01-09")]
        );
        assert!(remaining(&doc, &key("2026-01-08", 14, "a")).is_err());
    }
}
