//! Numeric secrets (PIN codes).
//!
//! Secrets are compared by integer value, not by text: `"007"`, `"7"` and
//! `" +7 "` are the same secret. Anything that is not an integer is
//! rejected at parse time, so callers never compare a non-numeric value.
//! Values of any length are supported; no fixed-width integer is involved.

use crate::error::{ZoneError, ZoneResult};
use serde_json::Value;
use std::fmt;

/// A secret normalised to its canonical integer form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NumericSecret {
    negative: bool,
    /// Decimal digits without leading zeros (`"0"` for zero).
    digits: String,
}

impl NumericSecret {
    /// Parse a textual secret.
    ///
    /// Accepts surrounding whitespace, an optional sign, and one or more
    /// ASCII digits.
    pub fn parse(text: &str) -> ZoneResult<Self> {
        let trimmed = text.trim();
        let (negative, body) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ZoneError::InvalidMessage("secret must be numeric".into()));
        }

        let stripped = body.trim_start_matches('0');
        let digits = if stripped.is_empty() {
            "0".to_string()
        } else {
            stripped.to_string()
        };
        let negative = negative && digits != "0";

        Ok(Self { negative, digits })
    }

    /// Parse a secret carried in JSON, either as a string or an integer.
    pub fn from_json(value: &Value) -> ZoneResult<Self> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::parse(&n.to_string()),
            _ => Err(ZoneError::InvalidMessage("secret must be numeric".into())),
        }
    }

    /// Canonical decimal rendering (no leading zeros).
    pub fn canonical(&self) -> String {
        if self.negative {
            format!("-{}", self.digits)
        } else {
            self.digits.clone()
        }
    }
}

impl fmt::Debug for NumericSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NumericSecret(<redacted>)")
    }
}
