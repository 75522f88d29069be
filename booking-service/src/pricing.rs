use std::collections::HashMap;
use std::str::FromStr;

use crate::domain::ClientId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("unknown coupon {0}")]
    UnknownCoupon(String),

    #[error("price overflow")]
    Overflow,

    #[error("invalid coupon table entry {0:?}")]
    InvalidEntry(String),
}

/// Discount hook applied to the base rental price.
pub trait DiscountPolicy: Send + Sync {
    fn apply_promotions(
        &self,
        client_id: ClientId,
        base_cents: i64,
        coupon: Option<&str>,
    ) -> Result<i64, PricingError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoPromotions;

impl DiscountPolicy for NoPromotions {
    fn apply_promotions(
        &self,
        _client_id: ClientId,
        base_cents: i64,
        _coupon: Option<&str>,
    ) -> Result<i64, PricingError> {
        Ok(base_cents)
    }
}

/// Percentage-off coupons keyed by upper-cased code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CouponTable {
    percent_off: HashMap<String, u8>,
}

impl CouponTable {
    pub fn is_empty(&self) -> bool {
        self.percent_off.is_empty()
    }
}

impl FromStr for CouponTable {
    type Err = PricingError;

    /// Parses `CODE=PERCENT` pairs separated by commas.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut percent_off = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (code, percent) = entry
                .split_once('=')
                .ok_or_else(|| PricingError::InvalidEntry(entry.to_string()))?;
            let percent: u8 = percent
                .trim()
                .parse()
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| PricingError::InvalidEntry(entry.to_string()))?;
            percent_off.insert(code.trim().to_uppercase(), percent);
        }
        Ok(Self { percent_off })
    }
}

impl DiscountPolicy for CouponTable {
    fn apply_promotions(
        &self,
        _client_id: ClientId,
        base_cents: i64,
        coupon: Option<&str>,
    ) -> Result<i64, PricingError> {
        let Some(code) = coupon.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(base_cents);
        };
        let percent = self
            .percent_off
            .get(&code.to_uppercase())
            .ok_or_else(|| PricingError::UnknownCoupon(code.to_string()))?;
        let discount = base_cents
            .checked_mul(i64::from(*percent))
            .ok_or(PricingError::Overflow)?
            / 100;
        Ok(base_cents - discount)
    }
}

/// `daily_price * days`, failing instead of wrapping.
pub fn base_price(daily_price_cents: i64, days: i64) -> Result<i64, PricingError> {
    daily_price_cents
        .checked_mul(days)
        .ok_or(PricingError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn table() -> CouponTable {
        "WELCOME10=10, vip=25".parse().unwrap()
    }

    #[rstest]
    #[case(None, 10_000)]
    #[case(Some(""), 10_000)]
    #[case(Some("welcome10"), 9_000)]
    #[case(Some("VIP"), 7_500)]
    fn coupons_take_a_percentage_off(#[case] coupon: Option<&str>, #[case] expected: i64) {
        assert_eq!(table().apply_promotions(1, 10_000, coupon), Ok(expected));
    }

    #[test]
    fn unknown_coupon_is_an_error() {
        assert_eq!(
            table().apply_promotions(1, 10_000, Some("NOPE")),
            Err(PricingError::UnknownCoupon("NOPE".to_string()))
        );
    }

    #[rstest]
    #[case("BROKEN")]
    #[case("HALF=fifty")]
    #[case("ALL=150")]
    fn malformed_table_is_rejected(#[case] raw: &str) {
        assert!(matches!(
            raw.parse::<CouponTable>(),
            Err(PricingError::InvalidEntry(_))
        ));
    }

    #[test]
    fn base_price_does_not_wrap() {
        assert_eq!(base_price(4_500, 3), Ok(13_500));
        assert_eq!(base_price(i64::MAX, 2), Err(PricingError::Overflow));
        assert_eq!(NoPromotions.apply_promotions(1, 13_500, Some("X")), Ok(13_500));
    }
}
