//! Hard limits on untrusted input. Everything arriving over the wire is checked
//! against these before it reaches the engine.

pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_ADVISOR_ID_LEN: usize = 64;
pub const MAX_TOPIC_LEN: usize = 256;
pub const MAX_CONTACT_FIELD_LEN: usize = 256;

pub const MAX_SLOT_CAPACITY: u32 = 1_000;
pub const MAX_SLOTS: usize = 100_000;
pub const MAX_WAITLIST_PER_SLOT: usize = 500;

/// Widest date range accepted by availability queries and schedule seeding.
pub const MAX_RANGE_DAYS: i64 = 366;
pub const MAX_SCHEDULE_TIMES: usize = 48;
pub const MAX_SCHEDULE_ADVISORS: usize = 256;

/// Longest request line accepted by the wire codec.
pub const MAX_LINE_LEN: usize = 64 * 1024;
