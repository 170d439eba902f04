//! Cart pricing chain.
//!
//! A bill is computed by running a fixed sequence of rule stages over a
//! shared [`Bill`] accumulator: coupon, then promotional discount, then
//! membership tier. Stages are pure functions of the policy and the bill,
//! so pricing the same cart twice yields the same bill.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::aggregates::ShoppingCartItem;
use crate::domain::value_objects::{CartItemId, Cents};

/// Discount rules in force for a deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub coupon: Option<DiscountRule>,
    pub promotion: Option<DiscountRule>,
    /// Membership discount in percent, `0..=100`.
    pub membership_off_rate: u8,
}

/// Fixed amount off once the original total exceeds `threshold`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountRule { pub id: i64, pub name: String, pub discount: Cents, pub threshold: Cents }

/// Outcome of pricing one cart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub original_total: Cents,
    /// Coupon that applied, if its threshold was met.
    pub coupon: Option<DiscountRule>,
    pub coupon_discount: Cents,
    pub promotion: Option<DiscountRule>,
    pub promotion_discount: Cents,
    pub membership_discount: Cents,
    /// Payable total, never below zero.
    pub total: Cents,
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("cannot price an empty cart")]
    EmptyCart,

    #[error("cart item {cart_item_id}: invalid quantity {quantity} or price {price}")]
    InvalidLine { cart_item_id: CartItemId, quantity: i64, price: Cents },

    #[error("cart total overflows")]
    Overflow,

    #[error("{stage} stage failed: {source}")]
    Stage { stage: &'static str, #[source] source: RuleError },
}

/// Error raised by a single rule stage.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule {0} has a negative discount")]
    NegativeDiscount(i64),
    #[error("rule {0} has a negative threshold")]
    NegativeThreshold(i64),
    #[error("membership rate {0} exceeds 100")]
    RateOutOfRange(u8),
    #[error("discount overflows")]
    Overflow,
}

/// A rule stage: populate its contribution on the bill or leave it at zero.
pub type PricingStage = fn(&PricingPolicy, &mut Bill) -> Result<(), RuleError>;

const STAGES: [(&str, PricingStage); 3] = [
    ("coupon", coupon_stage),
    ("promotion", promotion_stage),
    ("membership", membership_stage),
];

#[derive(Clone, Debug, Default)]
pub struct PricingChain {
    policy: PricingPolicy,
}

impl PricingChain {
    pub fn new(policy: PricingPolicy) -> Self { Self { policy } }

    pub fn bill(&self, items: &[ShoppingCartItem]) -> Result<Bill, PricingError> {
        if items.is_empty() {
            return Err(PricingError::EmptyCart);
        }

        let mut bill = Bill { original_total: original_total(items)?, ..Bill::default() };
        for (stage, run) in STAGES {
            run(&self.policy, &mut bill).map_err(|source| PricingError::Stage { stage, source })?;
        }

        bill.total = [bill.membership_discount, bill.coupon_discount, bill.promotion_discount]
            .into_iter()
            .try_fold(bill.original_total, Cents::checked_sub)
            .ok_or(PricingError::Overflow)?
            .max(0);
        Ok(bill)
    }
}

fn original_total(items: &[ShoppingCartItem]) -> Result<Cents, PricingError> {
    items.iter().try_fold(0 as Cents, |acc, item| {
        if item.commodity_num <= 0 || item.commodity_selling_price < 0 {
            return Err(PricingError::InvalidLine {
                cart_item_id: item.cart_item_id,
                quantity: item.commodity_num,
                price: item.commodity_selling_price,
            });
        }
        item.line_total().and_then(|line| acc.checked_add(line)).ok_or(PricingError::Overflow)
    })
}

/// Discount granted by `rule` for `total`, zero when the threshold is unmet.
fn threshold_discount(rule: &DiscountRule, total: Cents) -> Result<Cents, RuleError> {
    if rule.discount < 0 { return Err(RuleError::NegativeDiscount(rule.id)); }
    if rule.threshold < 0 { return Err(RuleError::NegativeThreshold(rule.id)); }
    Ok(if total > rule.threshold { rule.discount } else { 0 })
}

fn coupon_stage(policy: &PricingPolicy, bill: &mut Bill) -> Result<(), RuleError> {
    let Some(rule) = &policy.coupon else { return Ok(()) };
    let discount = threshold_discount(rule, bill.original_total)?;
    if discount > 0 {
        bill.coupon = Some(rule.clone());
        bill.coupon_discount = discount;
    }
    Ok(())
}

fn promotion_stage(policy: &PricingPolicy, bill: &mut Bill) -> Result<(), RuleError> {
    let Some(rule) = &policy.promotion else { return Ok(()) };
    let discount = threshold_discount(rule, bill.original_total)?;
    if discount > 0 {
        bill.promotion = Some(rule.clone());
        bill.promotion_discount = discount;
    }
    Ok(())
}

fn membership_stage(policy: &PricingPolicy, bill: &mut Bill) -> Result<(), RuleError> {
    let rate = policy.membership_off_rate;
    if rate > 100 {
        return Err(RuleError::RateOutOfRange(rate));
    }
    // round half up
    let scaled = bill.original_total.checked_mul(i64::from(rate)).ok_or(RuleError::Overflow)?;
    bill.membership_discount = (scaled + 50) / 100;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, price: i64, qty: i64) -> ShoppingCartItem {
        ShoppingCartItem { cart_item_id: id, user_id: 1, commodity_id: id, commodity_name: format!("C{id}"), commodity_img: String::new(), commodity_selling_price: price, commodity_num: qty }
    }

    fn rule(id: i64, discount: i64, threshold: i64) -> DiscountRule {
        DiscountRule { id, name: format!("rule-{id}"), discount, threshold }
    }

    fn policy() -> PricingPolicy {
        PricingPolicy { coupon: Some(rule(1, 100, 100)), promotion: Some(rule(2, 100, 1000)), membership_off_rate: 0 }
    }

    #[test]
    fn no_rules_bill_is_original_total() {
        let bill = PricingChain::default().bill(&[item(1, 100, 2), item(2, 50, 1)]).unwrap();
        assert_eq!(bill.original_total, 250);
        assert_eq!(bill.total, 250);
        assert!(bill.coupon.is_none());
    }

    #[test]
    fn coupon_applies_above_threshold_only() {
        let chain = PricingChain::new(policy());

        let bill = chain.bill(&[item(1, 100, 2)]).unwrap();
        assert_eq!(bill.coupon_discount, 100);
        assert_eq!(bill.promotion_discount, 0);
        assert_eq!(bill.total, 100);

        // exactly at the threshold: not exceeded
        let bill = chain.bill(&[item(1, 100, 1)]).unwrap();
        assert_eq!(bill.coupon, None);
        assert_eq!(bill.total, 100);
    }

    #[test]
    fn all_stages_contribute() {
        let chain = PricingChain::new(PricingPolicy { membership_off_rate: 10, ..policy() });
        let bill = chain.bill(&[item(1, 600, 2)]).unwrap();
        assert_eq!(bill.original_total, 1200);
        assert_eq!(bill.membership_discount, 120);
        assert_eq!(bill.coupon_discount, 100);
        assert_eq!(bill.promotion_discount, 100);
        assert_eq!(bill.total, 880);
    }

    #[test]
    fn membership_discount_rounds_half_up() {
        let chain = PricingChain::new(PricingPolicy { membership_off_rate: 5, ..PricingPolicy::default() });
        assert_eq!(chain.bill(&[item(1, 10, 1)]).unwrap().membership_discount, 1);
        assert_eq!(chain.bill(&[item(1, 9, 1)]).unwrap().membership_discount, 0);
    }

    #[test]
    fn total_never_negative() {
        let chain = PricingChain::new(PricingPolicy { coupon: Some(rule(1, 500, 0)), ..PricingPolicy::default() });
        assert_eq!(chain.bill(&[item(1, 100, 1)]).unwrap().total, 0);
    }

    #[test]
    fn huge_discounts_are_an_error_not_a_panic() {
        let chain = PricingChain::new(PricingPolicy { coupon: Some(rule(1, i64::MAX, 0)), promotion: Some(rule(2, i64::MAX, 0)), membership_off_rate: 0 });
        assert!(matches!(chain.bill(&[item(1, 100, 1)]), Err(PricingError::Overflow)));

        let chain = PricingChain::new(PricingPolicy { coupon: Some(rule(1, i64::MAX, 0)), ..PricingPolicy::default() });
        assert_eq!(chain.bill(&[item(1, 100, 1)]).unwrap().total, 0);
    }

    #[test]
    fn pricing_is_idempotent() {
        let chain = PricingChain::new(PricingPolicy { membership_off_rate: 15, ..policy() });
        let items = [item(1, 333, 3), item(2, 999, 1)];
        assert_eq!(chain.bill(&items).unwrap(), chain.bill(&items).unwrap());
    }

    #[test]
    fn failing_stage_aborts_with_stage_name() {
        let chain = PricingChain::new(PricingPolicy { promotion: Some(rule(9, -1, 0)), ..PricingPolicy::default() });
        let err = chain.bill(&[item(1, 100, 1)]).unwrap_err();
        assert!(matches!(err, PricingError::Stage { stage: "promotion", source: RuleError::NegativeDiscount(9) }));

        let chain = PricingChain::new(PricingPolicy { membership_off_rate: 101, ..PricingPolicy::default() });
        let err = chain.bill(&[item(1, 100, 1)]).unwrap_err();
        assert!(matches!(err, PricingError::Stage { stage: "membership", .. }));
    }

    #[test]
    fn rejects_empty_and_invalid_carts() {
        let chain = PricingChain::default();
        assert!(matches!(chain.bill(&[]), Err(PricingError::EmptyCart)));
        assert!(matches!(chain.bill(&[item(4, 100, 0)]), Err(PricingError::InvalidLine { cart_item_id: 4, .. })));
        assert!(matches!(chain.bill(&[item(1, i64::MAX, 1), item(2, 1, 1)]), Err(PricingError::Overflow)));
    }
}
