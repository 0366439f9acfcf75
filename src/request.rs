use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

/// A validated request, ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CheckAvailability {
        range: DateRange,
        advisor_id: Option<String>,
    },
    SlotOverview {
        range: DateRange,
        advisor_id: Option<String>,
    },
    AvailableDates {
        advisor_id: Option<String>,
    },
    Book(BookRequest),
    Reschedule {
        booking_id: Ulid,
        slot: SlotKey,
    },
    Cancel {
        booking_id: Ulid,
    },
    Amend {
        booking_id: Ulid,
        contact: Option<Contact>,
        topic: Option<String>,
    },
    Lookup(LookupCriteria),
    LookupCode {
        code: Ulid,
    },
    JoinWaitlist {
        user_id: String,
        contact: Contact,
        topic: Option<String>,
        slot: SlotKey,
    },
    Withdraw {
        user_id: String,
        slot: SlotKey,
    },
    WithdrawEntry {
        entry_id: Ulid,
    },
    Promote {
        slot: SlotKey,
    },
    AdminView,
    OpenSlot {
        slot: SlotKey,
        capacity: u32,
    },
    OpenSchedule(SlotSchedule),
    SetCapacity {
        slot: SlotKey,
        capacity: u32,
    },
    Listen {
        advisor_id: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} too long")]
    TooLong(&'static str),
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    BadDate(String),
    #[error("invalid time {0:?}, expected HH:MM")]
    BadTime(String),
    #[error("invalid {0} {1:?}")]
    BadId(&'static str, String),
    #[error("{0}")]
    OutOfRange(String),
}

/// Wire shape of a request line, tagged by `op`. Dates, times and ids stay
/// strings here so bad values produce a precise error instead of a serde one.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RawRequest {
    CheckAvailability {
        from: String,
        to: Option<String>,
        advisor_id: Option<String>,
    },
    SlotOverview {
        from: String,
        to: Option<String>,
        advisor_id: Option<String>,
    },
    AvailableDates {
        advisor_id: Option<String>,
    },
    Book {
        user_id: String,
        #[serde(default)]
        contact: Contact,
        topic: Option<String>,
        date: String,
        time: String,
        advisor_id: String,
        #[serde(default)]
        on_full: OnFull,
    },
    Reschedule {
        booking_id: String,
        date: String,
        time: String,
        advisor_id: String,
    },
    Cancel {
        booking_id: String,
    },
    Amend {
        booking_id: String,
        contact: Option<Contact>,
        topic: Option<String>,
    },
    Lookup {
        booking_id: Option<String>,
        user_id: Option<String>,
        name: Option<String>,
        date: Option<String>,
        time: Option<String>,
        advisor_id: Option<String>,
        #[serde(default)]
        confirmed_only: bool,
    },
    LookupCode {
        code: String,
    },
    JoinWaitlist {
        user_id: String,
        #[serde(default)]
        contact: Contact,
        topic: Option<String>,
        date: String,
        time: String,
        advisor_id: String,
    },
    Withdraw {
        user_id: String,
        date: String,
        time: String,
        advisor_id: String,
    },
    WithdrawEntry {
        entry_id: String,
    },
    Promote {
        date: String,
        time: String,
        advisor_id: String,
    },
    AdminView,
    OpenSlot {
        date: String,
        time: String,
        advisor_id: String,
        capacity: u32,
    },
    OpenSchedule {
        from: String,
        to: String,
        times: Vec<String>,
        advisors: Vec<String>,
        capacity: u32,
        #[serde(default)]
        weekdays_only: bool,
    },
    SetCapacity {
        date: String,
        time: String,
        advisor_id: String,
        capacity: u32,
    },
    Listen {
        advisor_id: String,
    },
}

pub fn parse_request(line: &str) -> Result<Command, RequestError> {
    let raw: RawRequest = serde_json::from_str(line)?;
    Ok(match raw {
        RawRequest::CheckAvailability { from, to, advisor_id } => Command::CheckAvailability {
            range: parse_range(&from, to.as_deref())?,
            advisor_id: optional_advisor(advisor_id)?,
        },
        RawRequest::SlotOverview { from, to, advisor_id } => Command::SlotOverview {
            range: parse_range(&from, to.as_deref())?,
            advisor_id: optional_advisor(advisor_id)?,
        },
        RawRequest::AvailableDates { advisor_id } => Command::AvailableDates {
            advisor_id: optional_advisor(advisor_id)?,
        },
        RawRequest::Book {
            user_id,
            contact,
            topic,
            date,
            time,
            advisor_id,
            on_full,
        } => Command::Book(BookRequest {
            user_id: user(user_id)?,
            contact: checked_contact(contact)?,
            topic: checked_topic(topic)?,
            slot: slot_key(&date, &time, advisor_id)?,
            on_full,
        }),
        RawRequest::Reschedule {
            booking_id,
            date,
            time,
            advisor_id,
        } => Command::Reschedule {
            booking_id: parse_ulid("booking_id", &booking_id)?,
            slot: slot_key(&date, &time, advisor_id)?,
        },
        RawRequest::Cancel { booking_id } => Command::Cancel {
            booking_id: parse_ulid("booking_id", &booking_id)?,
        },
        RawRequest::Amend {
            booking_id,
            contact,
            topic,
        } => Command::Amend {
            booking_id: parse_ulid("booking_id", &booking_id)?,
            contact: contact.map(checked_contact).transpose()?,
            topic: checked_topic(topic)?,
        },
        RawRequest::Lookup {
            booking_id,
            user_id,
            name,
            date,
            time,
            advisor_id,
            confirmed_only,
        } => Command::Lookup(LookupCriteria {
            booking_id: booking_id
                .map(|id| parse_ulid("booking_id", &id))
                .transpose()?,
            user_id: user_id.map(user).transpose()?,
            contact_name: name.map(|n| bounded("name", n, MAX_CONTACT_FIELD_LEN)).transpose()?,
            date: date.as_deref().map(parse_date).transpose()?,
            time: time.as_deref().map(parse_time).transpose()?,
            advisor_id: optional_advisor(advisor_id)?,
            confirmed_only: confirmed_only.then_some(true),
        }),
        RawRequest::LookupCode { code } => Command::LookupCode {
            code: parse_ulid("code", &code)?,
        },
        RawRequest::JoinWaitlist {
            user_id,
            contact,
            topic,
            date,
            time,
            advisor_id,
        } => Command::JoinWaitlist {
            user_id: user(user_id)?,
            contact: checked_contact(contact)?,
            topic: checked_topic(topic)?,
            slot: slot_key(&date, &time, advisor_id)?,
        },
        RawRequest::Withdraw {
            user_id,
            date,
            time,
            advisor_id,
        } => Command::Withdraw {
            user_id: user(user_id)?,
            slot: slot_key(&date, &time, advisor_id)?,
        },
        RawRequest::WithdrawEntry { entry_id } => Command::WithdrawEntry {
            entry_id: parse_ulid("entry_id", &entry_id)?,
        },
        RawRequest::Promote {
            date,
            time,
            advisor_id,
        } => Command::Promote {
            slot: slot_key(&date, &time, advisor_id)?,
        },
        RawRequest::AdminView => Command::AdminView,
        RawRequest::OpenSlot {
            date,
            time,
            advisor_id,
            capacity,
        } => Command::OpenSlot {
            slot: slot_key(&date, &time, advisor_id)?,
            capacity: checked_capacity(capacity)?,
        },
        RawRequest::OpenSchedule {
            from,
            to,
            times,
            advisors,
            capacity,
            weekdays_only,
        } => {
            if times.len() > MAX_SCHEDULE_TIMES {
                return Err(RequestError::TooLong("times"));
            }
            if advisors.len() > MAX_SCHEDULE_ADVISORS {
                return Err(RequestError::TooLong("advisors"));
            }
            Command::OpenSchedule(SlotSchedule {
                range: parse_range(&from, Some(&to))?,
                times: times.iter().map(|t| parse_time(t)).collect::<Result<_, _>>()?,
                advisors: advisors.into_iter().map(advisor).collect::<Result<_, _>>()?,
                capacity: checked_capacity(capacity)?,
                weekdays_only,
            })
        }
        RawRequest::SetCapacity {
            date,
            time,
            advisor_id,
            capacity,
        } => Command::SetCapacity {
            slot: slot_key(&date, &time, advisor_id)?,
            capacity: checked_capacity(capacity)?,
        },
        RawRequest::Listen { advisor_id } => Command::Listen {
            advisor_id: advisor(advisor_id)?,
        },
    })
}

fn parse_date(s: &str) -> Result<NaiveDate, RequestError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| RequestError::BadDate(s.to_string()))
}

fn parse_time(s: &str) -> Result<NaiveTime, RequestError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| RequestError::BadTime(s.to_string()))
}

fn parse_ulid(what: &'static str, s: &str) -> Result<Ulid, RequestError> {
    Ulid::from_string(s.trim()).map_err(|_| RequestError::BadId(what, s.to_string()))
}

/// Inclusive range; a missing `to` means the single day `from`.
fn parse_range(from: &str, to: Option<&str>) -> Result<DateRange, RequestError> {
    let from = parse_date(from)?;
    let to = match to {
        Some(t) => parse_date(t)?,
        None => from,
    };
    if to < from {
        return Err(RequestError::OutOfRange(format!("date range {from} .. {to} is reversed")));
    }
    let range = DateRange { from, to };
    if range.days() > MAX_RANGE_DAYS {
        return Err(RequestError::OutOfRange(format!(
            "date range spans {} days, at most {MAX_RANGE_DAYS} allowed",
            range.days()
        )));
    }
    Ok(range)
}

fn bounded(what: &'static str, value: String, max: usize) -> Result<String, RequestError> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(RequestError::Empty(what));
    }
    if value.len() > max {
        return Err(RequestError::TooLong(what));
    }
    Ok(value)
}

fn user(value: String) -> Result<String, RequestError> {
    bounded("user_id", value, MAX_USER_ID_LEN)
}

fn advisor(value: String) -> Result<String, RequestError> {
    bounded("advisor_id", value, MAX_ADVISOR_ID_LEN)
}

fn optional_advisor(value: Option<String>) -> Result<Option<String>, RequestError> {
    value.map(advisor).transpose()
}

fn slot_key(date: &str, time: &str, advisor_id: String) -> Result<SlotKey, RequestError> {
    Ok(SlotKey::new(parse_date(date)?, parse_time(time)?, advisor(advisor_id)?))
}

fn checked_capacity(capacity: u32) -> Result<u32, RequestError> {
    if capacity == 0 || capacity > MAX_SLOT_CAPACITY {
        return Err(RequestError::OutOfRange(format!(
            "capacity must be between 1 and {MAX_SLOT_CAPACITY}"
        )));
    }
    Ok(capacity)
}

fn checked_topic(topic: Option<String>) -> Result<Option<String>, RequestError> {
    match topic {
        Some(t) if t.trim().is_empty() => Ok(None),
        Some(t) => bounded("topic", t, MAX_TOPIC_LEN).map(Some),
        None => Ok(None),
    }
}

/// Blank fields count as absent.
fn checked_contact(contact: Contact) -> Result<Contact, RequestError> {
    let field = |what: &'static str, v: Option<String>| -> Result<Option<String>, RequestError> {
        match v {
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => bounded(what, s, MAX_CONTACT_FIELD_LEN).map(Some),
            None => Ok(None),
        }
    };
    Ok(Contact {
        name: field("name", contact.name)?,
        email: field("email", contact.email)?,
        phone: field("phone", contact.phone)?,
    })
}
