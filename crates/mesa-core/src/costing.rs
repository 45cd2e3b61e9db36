//! # Costing Math
//!
//! Weighted-average unit cost, computed on every supply event.
//!
//! ## The Running Average
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  stock = 10 @ avg 2.00          supply: 10 units for 30.00 total        │
//! │                                                                         │
//! │            (10 × 200) + 3000      5000                                  │
//! │  new avg = ───────────────── = ──────── = 250 cents = $2.50             │
//! │               10 + 10              20                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//! All arithmetic is integer cents widened to i128 so that even absurd
//! inventories cannot overflow, with half-up rounding on the division.

use crate::money::Money;

// =============================================================================
// Batch Unit Cost
// =============================================================================

/// Per-unit cost of a received batch, half-up rounded to whole cents.
///
/// Returns `None` when `quantity` is not positive; a supply of zero units
/// has no meaningful unit cost.
pub fn batch_unit_cost(total_cost: Money, quantity: i64) -> Option<Money> {
    if quantity <= 0 {
        return None;
    }
    Some(Money::from_cents(div_half_up(
        total_cost.cents() as i128,
        quantity as i128,
    )))
}

// =============================================================================
// Weighted Average
// =============================================================================

/// Recomputes the running weighted-average cost after a supply event.
///
/// ## Legacy Substitution
/// An item migrated from a system that never tracked cost shows
/// `old_avg == 0` with positive stock. Blending against a zero average
/// would drag the result toward zero and misprice every unit on hand,
/// so the incoming batch's unit cost stands in for the unknown history.
///
/// Returns `None` when `quantity` is not positive.
pub fn weighted_average_cost(
    old_stock: i64,
    old_avg: Money,
    quantity: i64,
    total_cost: Money,
) -> Option<Money> {
    if quantity <= 0 {
        return None;
    }

    // Negative counters can appear after untracked sales; treat them as
    // empty so the average reflects only the incoming batch.
    let old_stock = old_stock.max(0);

    let effective_old_avg = if old_avg.is_zero() && old_stock > 0 {
        // Legacy substitution: price unknown history at the batch rate.
        batch_unit_cost(total_cost, quantity)?
    } else {
        old_avg
    };

    let old_value = old_stock as i128 * effective_old_avg.cents() as i128;
    let new_value = old_value + total_cost.cents() as i128;
    let new_stock = old_stock as i128 + quantity as i128;

    Some(Money::from_cents(div_half_up(new_value, new_stock)))
}

/// Integer division rounded half-up (2.5 → 3, not banker's 2).
fn div_half_up(numerator: i128, divisor: i128) -> i64 {
    ((numerator + divisor / 2) / divisor) as i64
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textbook_blend() {
        // 10 units at $2.00, then 10 units for $30.00 total ⇒ $2.50.
        let avg = weighted_average_cost(10, Money::from_cents(200), 10, Money::from_cents(3000));
        assert_eq!(avg, Some(Money::from_cents(250)));
    }

    #[test]
    fn test_first_supply_on_empty_stock() {
        let avg = weighted_average_cost(0, Money::zero(), 4, Money::from_cents(1000));
        assert_eq!(avg, Some(Money::from_cents(250)));
    }

    #[test]
    fn test_legacy_zero_average_substitution() {
        // 20 legacy units with unknown cost, batch arrives at $1.50/unit.
        // Without substitution the blend would be 600/24 = $0.25.
        let avg = weighted_average_cost(20, Money::zero(), 4, Money::from_cents(600));
        assert_eq!(avg, Some(Money::from_cents(150)));
    }

    #[test]
    fn test_half_up_rounding() {
        // (1 × 100 + 101) / 2 = 100.5 ⇒ 101.
        let avg = weighted_average_cost(1, Money::from_cents(100), 1, Money::from_cents(101));
        assert_eq!(avg, Some(Money::from_cents(101)));
    }

    #[test]
    fn test_negative_counter_treated_as_empty() {
        let avg = weighted_average_cost(-3, Money::from_cents(900), 10, Money::from_cents(2000));
        assert_eq!(avg, Some(Money::from_cents(200)));
    }

    #[test]
    fn test_zero_quantity_rejected() {
        assert_eq!(batch_unit_cost(Money::from_cents(500), 0), None);
        assert_eq!(
            weighted_average_cost(5, Money::from_cents(100), 0, Money::from_cents(500)),
            None
        );
    }

    #[test]
    fn test_batch_unit_cost() {
        assert_eq!(
            batch_unit_cost(Money::from_cents(3000), 10),
            Some(Money::from_cents(300))
        );
        // 1000 / 3 = 333.33… ⇒ 333.
        assert_eq!(
            batch_unit_cost(Money::from_cents(1000), 3),
            Some(Money::from_cents(333))
        );
    }
}
