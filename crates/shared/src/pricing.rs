//! Booking prices and coupon discounts
//!
//! All amounts are integer cents. Every price shown to a customer, charged at
//! checkout or stored on an appointment is computed here.

use serde::{Deserialize, Serialize};

/// How a coupon reduces the price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// `value` is a percentage between 1 and 100
    Percentage,
    /// `value` is an amount in cents
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "percentage" | "percent" => Some(Self::Percentage),
            "fixed" | "amount" => Some(Self::Fixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("percentage discount must be between 1 and 100, got {0}")]
    InvalidPercentage(i64),
    #[error("fixed discount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("booking length must be positive")]
    InvalidDuration,
    #[error("amount is too large")]
    Overflow,
}

/// A validated discount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Discount {
    pub kind: DiscountType,
    pub value: i64,
}

impl Discount {
    pub fn new(kind: DiscountType, value: i64) -> Result<Self, PricingError> {
        match kind {
            DiscountType::Percentage if !(1..=100).contains(&value) => {
                Err(PricingError::InvalidPercentage(value))
            }
            DiscountType::Fixed if value <= 0 => Err(PricingError::InvalidAmount(value)),
            _ => Ok(Self { kind, value }),
        }
    }

    /// Cents taken off `subtotal_cents`, never more than the subtotal
    pub fn amount_off(&self, subtotal_cents: i64) -> i64 {
        if subtotal_cents <= 0 {
            return 0;
        }
        let off = match self.kind {
            DiscountType::Percentage => {
                div_round_half_up(i128::from(subtotal_cents) * i128::from(self.value), 100)
            }
            DiscountType::Fixed => i128::from(self.value),
        };
        // Clamped to the subtotal, so it always fits back into i64
        off.clamp(0, i128::from(subtotal_cents)) as i64
    }
}

/// Priced booking or purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
}

impl Quote {
    pub fn compute(subtotal_cents: i64, discount: Option<&Discount>) -> Self {
        let subtotal_cents = subtotal_cents.max(0);
        let discount_cents = discount.map_or(0, |d| d.amount_off(subtotal_cents));
        Self {
            subtotal_cents,
            discount_cents,
            total_cents: subtotal_cents - discount_cents,
        }
    }

    /// Nothing left to pay, so no checkout is needed
    pub fn is_free(&self) -> bool {
        self.total_cents == 0
    }
}

/// Price of `minutes` of studio time at `hourly_rate_cents`, prorated by the minute
pub fn booking_subtotal(hourly_rate_cents: i64, minutes: i64) -> Result<i64, PricingError> {
    if minutes <= 0 {
        return Err(PricingError::InvalidDuration);
    }
    let cents = div_round_half_up(i128::from(hourly_rate_cents.max(0)) * i128::from(minutes), 60);
    i64::try_from(cents).map_err(|_| PricingError::Overflow)
}

/// Format cents for display, e.g. `15050` -> `"150.50"`
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{}{}.{:02}", sign, cents / 100, cents % 100)
}

fn div_round_half_up(numerator: i128, denominator: i128) -> i128 {
    (numerator + denominator / 2) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_rounds_half_up() {
        let d = Discount::new(DiscountType::Percentage, 15).unwrap();
        // 15% of 333 = 49.95
        assert_eq!(d.amount_off(333), 50);
    }

    #[test]
    fn test_full_percentage_is_free() {
        let d = Discount::new(DiscountType::Percentage, 100).unwrap();
        let q = Quote::compute(12_000, Some(&d));
        assert_eq!(q.discount_cents, 12_000);
        assert!(q.is_free());
    }

    #[test]
    fn test_fixed_discount_is_clamped() {
        let d = Discount::new(DiscountType::Fixed, 50_000).unwrap();
        let q = Quote::compute(15_000, Some(&d));
        assert_eq!(q.discount_cents, 15_000);
        assert_eq!(q.total_cents, 0);
    }

    #[test]
    fn test_zero_subtotal_has_no_discount() {
        let d = Discount::new(DiscountType::Fixed, 500).unwrap();
        assert_eq!(Quote::compute(0, Some(&d)).discount_cents, 0);
    }

    #[test]
    fn test_invalid_discounts_rejected() {
        assert_eq!(
            Discount::new(DiscountType::Percentage, 0),
            Err(PricingError::InvalidPercentage(0))
        );
        assert_eq!(
            Discount::new(DiscountType::Percentage, 101),
            Err(PricingError::InvalidPercentage(101))
        );
        assert_eq!(
            Discount::new(DiscountType::Fixed, -1),
            Err(PricingError::InvalidAmount(-1))
        );
    }

    #[test]
    fn test_booking_subtotal_prorates() {
        assert_eq!(booking_subtotal(15_000, 60), Ok(15_000));
        assert_eq!(booking_subtotal(15_000, 90), Ok(22_500));
        assert_eq!(booking_subtotal(10_000, 20), Ok(3_333));
        assert_eq!(booking_subtotal(10_000, 0), Err(PricingError::InvalidDuration));
    }

    #[test]
    fn test_no_coupon_quote() {
        let q = Quote::compute(9_900, None);
        assert_eq!(q.total_cents, 9_900);
        assert!(!q.is_free());
    }

    #[test]
    fn test_huge_amounts_do_not_overflow() {
        let d = Discount::new(DiscountType::Percentage, 10).unwrap();
        let quote = Quote::compute(i64::MAX / 10, Some(&d));
        assert_eq!(quote.discount_cents, 92_233_720_368_547_758);
        assert_eq!(quote.total_cents, quote.subtotal_cents - quote.discount_cents);

        let full = Discount::new(DiscountType::Percentage, 100).unwrap();
        assert!(Quote::compute(i64::MAX, Some(&full)).is_free());

        assert_eq!(
            booking_subtotal(i64::MAX, 24 * 60),
            Err(PricingError::Overflow)
        );
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(15_050), "150.50");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(-250), "-2.50");
    }

    #[test]
    fn test_discount_type_parse() {
        assert_eq!(DiscountType::parse(" Percentage "), Some(DiscountType::Percentage));
        assert_eq!(DiscountType::parse("fixed"), Some(DiscountType::Fixed));
        assert_eq!(DiscountType::parse("free"), None);
    }
}
