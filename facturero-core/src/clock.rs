//! Ecuador wall-clock helpers. The SRI operates on continental Ecuador
//! time, fixed at UTC-05 with no daylight saving.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

const ECUADOR_OFFSET_SECONDS: i32 = 5 * 3600;

/// Fixed UTC-05 offset used for every "now" comparison.
pub(crate) fn ecuador_offset() -> FixedOffset {
    FixedOffset::west_opt(ECUADOR_OFFSET_SECONDS).expect("static offset is in range")
}

/// Current instant expressed in Ecuador local time.
pub(crate) fn now_in_ecuador() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&ecuador_offset())
}

/// Current calendar day in Ecuador.
pub(crate) fn today_in_ecuador() -> NaiveDate {
    now_in_ecuador().date_naive()
}
