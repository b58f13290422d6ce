//! Fixed-point base units. The venue trades two assets at a 7-decimal scale;
//! every quantity and price on the matching path is an integer so that fills
//! are exact and reproducible across runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Denominator implied by every `Price`: 10^7, i.e. 7 fractional digits.
pub const SCALE: u64 = 10_000_000;

/// A non-negative quantity of an asset in base units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn min(self, rhs: Amount) -> Amount {
        Amount(self.0.min(rhs.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:07}", self.0 / SCALE, self.0 % SCALE)
    }
}

/// `price_num` over the implicit `SCALE` denominator: units of B per unit of A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(pub u64);

impl Price {
    /// `floor(price_num * qty / SCALE)`, the B-side notional for a fill of
    /// `qty` at this price. `None` on overflow of the u128 intermediate,
    /// which callers must treat as an internal invariant violation — trade
    /// sizes that overflow should have been rejected at order validation.
    pub fn notional(self, qty: Amount) -> Option<Amount> {
        let product = (self.0 as u128).checked_mul(qty.0 as u128)?;
        let floored = product / SCALE as u128;
        u64::try_from(floored).ok().map(Amount)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:07}", self.0 / SCALE, self.0 % SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notional_floors_fractional_wei() {
        // price 2.0000003, qty 3 base units -> 6.0000009 floored to 6 units
        let price = Price(2 * SCALE + 3);
        let qty = Amount(3);
        assert_eq!(price.notional(qty), Some(Amount(6)));
    }

    #[test]
    fn notional_overflow_is_none() {
        let price = Price(u64::MAX);
        let qty = Amount(u64::MAX);
        assert_eq!(price.notional(qty), None);
    }

    #[test]
    fn display_renders_seven_decimals() {
        assert_eq!(Amount(25_000_000).to_string(), "2.5000000");
    }
}
