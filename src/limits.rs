/// Max loan items a single loan may hold (after per-unit expansion).
pub const MAX_ITEMS_PER_LOAN: usize = 500;

/// Max units requested by one reservation line.
pub const MAX_UNITS_PER_LINE: u32 = 10_000;

/// Max serialized units in one line (each becomes its own loan item).
pub const MAX_SERIALIZED_UNITS_PER_LINE: u32 = 100;

pub const MAX_NOTE_LEN: usize = 4096;
pub const MAX_NAME_LEN: usize = 256;

/// Longest loan period, in days.
pub const MAX_LOAN_DAYS: i64 = 366;

/// Widest calendar query, in days.
pub const MAX_CALENDAR_DAYS: i64 = 366;

pub const MAX_CART_LINES: usize = 100;
pub const MAX_BUNDLE_ITEMS: usize = 64;
