//! Decimal-string parsing at the request boundary. The core never carries a
//! `Decimal` type past this module — everything downstream of the executor
//! is an integer `Amount`/`Price` at the fixed 7-decimal scale (spec.md §3,
//! §6). The teacher's `matching_engine` crate leans on `rust_decimal`
//! end-to-end; here that dependency is narrowed to this one parsing seam,
//! see DESIGN.md for why.

use matching_engine::{Amount, Price, SCALE};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecimalError {
    #[error("empty decimal string")]
    Empty,
    #[error("not a decimal number: {0}")]
    NotANumber(String),
    #[error("more than 7 fractional digits: {0}")]
    TooManyFractionalDigits(String),
    #[error("value overflows base-unit range: {0}")]
    Overflow(String),
}

/// Parses `"123.4567890"`-style strings into base units at `SCALE = 10^7`.
/// More than 7 fractional digits is a rejection, not a silent truncation.
fn parse_base_units(input: &str) -> Result<u64, DecimalError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DecimalError::Empty);
    }
    if !input.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return Err(DecimalError::NotANumber(input.to_string()));
    }

    let mut parts = input.splitn(2, '.');
    let whole = parts.next().unwrap_or("");
    let frac = parts.next().unwrap_or("");

    if frac.len() > 7 {
        return Err(DecimalError::TooManyFractionalDigits(input.to_string()));
    }
    if whole.is_empty() && frac.is_empty() {
        return Err(DecimalError::NotANumber(input.to_string()));
    }

    let whole_units: u64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| DecimalError::NotANumber(input.to_string()))?
    };
    let mut frac_units: u64 = if frac.is_empty() {
        0
    } else {
        frac.parse()
            .map_err(|_| DecimalError::NotANumber(input.to_string()))?
    };
    // Pad the fractional part out to 7 digits' worth of scale, e.g. "5" -> 5_000_000.
    for _ in 0..(7 - frac.len()) {
        frac_units = frac_units.checked_mul(10).ok_or_else(|| DecimalError::Overflow(input.to_string()))?;
    }

    whole_units
        .checked_mul(SCALE)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| DecimalError::Overflow(input.to_string()))
}

/// Parses a quantity/amount decimal string into base units.
pub fn parse_amount(input: &str) -> Result<Amount, DecimalError> {
    parse_base_units(input).map(Amount)
}

/// Parses a price decimal string (units of B per unit of A) into `price_num`.
pub fn parse_price(input: &str) -> Result<Price, DecimalError> {
    parse_base_units(input).map(Price)
}

/// Parses an already-integer base-unit string, as used by the withdrawal
/// request body (spec.md §6: `amount: integer-string (base units)`).
pub fn parse_integer_amount(input: &str) -> Result<Amount, DecimalError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DecimalError::Empty);
    }
    input
        .parse::<u64>()
        .map(Amount)
        .map_err(|_| DecimalError::NotANumber(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_and_fractional_parts() {
        assert_eq!(parse_amount("2.5").unwrap(), Amount(25_000_000));
        assert_eq!(parse_amount("100").unwrap(), Amount(100 * SCALE));
        assert_eq!(parse_price("0.0000001").unwrap(), Price(1));
    }

    #[test]
    fn rejects_more_than_seven_fractional_digits() {
        let err = parse_amount("1.12345678").unwrap_err();
        assert!(matches!(err, DecimalError::TooManyFractionalDigits(_)));
    }

    #[test]
    fn rejects_non_numeric_input() {
        assert!(parse_amount("abc").unwrap_err() == DecimalError::NotANumber("abc".into()));
        assert!(parse_amount("").is_err());
    }

    #[test]
    fn integer_amount_rejects_decimal_point() {
        assert!(parse_integer_amount("12.5").is_err());
        assert_eq!(parse_integer_amount("12500000").unwrap(), Amount(12_500_000));
    }
}
