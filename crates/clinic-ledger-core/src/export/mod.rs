//! Payout and compliance exports.

mod compliance;
mod payouts;

pub use compliance::*;
pub use payouts::*;

/// Quote a CSV field when it contains a comma, quote or line break.
pub(crate) fn escape_csv(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
