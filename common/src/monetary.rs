//! Monetary types for the wallet ledger.
//!
//! Balances are single-currency fixed-point decimals. Transaction amounts are
//! strictly positive magnitudes; the direction comes from the transaction kind.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of decimal places amounts are normalised to.
pub const AMOUNT_SCALE: u32 = 2;

/// Exclusive upper bound of a stored amount: `NUMERIC(20,2)` holds 18 integer digits.
pub const AMOUNT_LIMIT: Decimal = Decimal::from_parts(0xA764_0000, 0x0DE0_B6B3, 0, false, 0);

/// A strictly positive transaction amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    /// Create an amount, rejecting zero, negative and out-of-range values.
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value <= Decimal::ZERO {
            return Err(AmountError::NotPositive(value));
        }
        if value >= AMOUNT_LIMIT {
            return Err(AmountError::TooLarge(value));
        }
        if value.round_dp(AMOUNT_SCALE) != value {
            return Err(AmountError::TooPrecise(value));
        }
        Ok(Self(value))
    }

    /// Parse an amount from its decimal string form.
    pub fn parse(value: &str) -> Result<Self, AmountError> {
        let value: Decimal = value
            .trim()
            .parse()
            .map_err(|_| AmountError::Malformed(value.to_string()))?;
        Self::new(value)
    }

    /// Get the underlying value.
    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AmountError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = <Decimal as Deserialize>::deserialize(deserializer)?;
        Amount::new(value).map_err(serde::de::Error::custom)
    }
}

/// Error raised when an amount does not satisfy `amount > 0`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// Zero or negative amount.
    #[error("amount must be greater than 0, got {0}")]
    NotPositive(Decimal),
    /// At or above [`AMOUNT_LIMIT`].
    #[error("amount {0} exceeds the storable range")]
    TooLarge(Decimal),
    /// More fractional digits than the ledger stores.
    #[error("amount {0} has more than {max} decimal places", max = AMOUNT_SCALE)]
    TooPrecise(Decimal),
    /// Not a decimal number.
    #[error("amount {0:?} is not a decimal number")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_must_be_positive() {
        assert!(Amount::new(Decimal::from(7)).is_ok());
        assert_eq!(
            Amount::new(Decimal::ZERO),
            Err(AmountError::NotPositive(Decimal::ZERO))
        );
        assert!(Amount::new(Decimal::from(-1)).is_err());
    }

    #[test]
    fn test_amount_upper_bound() {
        assert_eq!(AMOUNT_LIMIT, Decimal::from(1_000_000_000_000_000_000i64));
        assert_eq!(
            Amount::new(Decimal::MAX),
            Err(AmountError::TooLarge(Decimal::MAX))
        );
        assert!(matches!(
            Amount::parse("79228162514264337593543950335"),
            Err(AmountError::TooLarge(_))
        ));
        assert!(Amount::new(AMOUNT_LIMIT).is_err());
        assert!(Amount::parse("999999999999999999.99").is_ok());
        assert!(serde_json::from_str::<Amount>("\"1000000000000000000\"").is_err());
    }

    #[test]
    fn test_amount_parse() {
        let amount = Amount::parse("10.15").unwrap();
        assert_eq!(amount.value(), Decimal::from_str_exact("10.15").unwrap());
        assert!(matches!(Amount::parse("ten"), Err(AmountError::Malformed(_))));
        assert!(matches!(Amount::parse("0.001"), Err(AmountError::TooPrecise(_))));
        // Trailing zeros beyond the scale are harmless.
        assert!(Amount::parse("1.5000").is_ok());
    }

    #[test]
    fn test_amount_deserialize_number_or_string() {
        let from_str: Amount = serde_json::from_str("\"2.50\"").unwrap();
        let from_num: Amount = serde_json::from_str("2").unwrap();
        assert_eq!(from_str.value(), Decimal::from_str_exact("2.50").unwrap());
        assert_eq!(from_num.value(), Decimal::from(2));
        assert!(serde_json::from_str::<Amount>("0").is_err());
    }
}
