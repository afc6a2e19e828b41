//! HTTP-date formatting and parsing (RFC 9110 §5.6.7).
//!
//! Dates go out as IMF-fixdate. Inbound dates are also accepted in the two
//! obsolete forms (RFC 850 and asctime). HTTP dates have one-second
//! resolution, so anything finer is dropped on formatting.

use chrono::{DateTime, NaiveDateTime, Utc};

const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const RFC_850: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME: &str = "%a %b %e %H:%M:%S %Y";

/// Formats `at` as an IMF-fixdate, e.g. `Wed, 01 Jan 2020 00:00:00 GMT`.
pub fn fmt_http_date(at: DateTime<Utc>) -> String {
    at.format(IMF_FIXDATE).to_string()
}

/// Parses any of the three HTTP-date forms. Returns `None` for anything else.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    // asctime pads single-digit days with a space
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
    [IMF_FIXDATE, RFC_850, ASCTIME]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&value, format).ok())
        .map(|naive| naive.and_utc())
}
