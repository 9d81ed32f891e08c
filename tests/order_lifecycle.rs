//! State machine properties exercised through the public API.

use lnbarter::domain::{
    fee_for, market_sats, CoopCancelOutcome, NewOrder, Order, OrderKind, OrderStatus, TradeParty,
};
use lnbarter::error::EngineError;
use rust_decimal_macros::dec;

fn sell_order(amount: i64) -> Order {
    Order::from_request(&NewOrder {
        kind: OrderKind::Sell,
        creator_id: 10,
        amount,
        fiat_code: "EUR".to_string(),
        fiat_amount: Some(dec!(100)),
        min_amount: None,
        max_amount: None,
        payment_method: "SEPA".to_string(),
        price_margin: dec!(0),
        community_id: None,
    })
}

fn taken_sell_order() -> Order {
    let mut order = sell_order(200_000);
    order.seller_id = Some(order.creator_id);
    order.buyer_id = Some(20);
    order.transition(OrderStatus::WaitingBuyerInvoice).unwrap();
    order
}

#[test]
fn happy_path_reaches_success() {
    let mut order = taken_sell_order();

    order.transition(OrderStatus::WaitingPayment).unwrap();
    order.transition(OrderStatus::Active).unwrap();
    order.transition(OrderStatus::FiatSent).unwrap();
    order.transition(OrderStatus::PaidHoldInvoice).unwrap();
    order.transition(OrderStatus::Success).unwrap();

    assert!(order.status.is_terminal());
}

#[test]
fn terminal_states_are_absorbing() {
    for from in OrderStatus::ALL {
        if !from.is_terminal() {
            continue;
        }
        for to in OrderStatus::ALL {
            assert!(
                !from.can_transition_to(to),
                "terminal {from} must not reach {to}"
            );
        }
    }
}

#[test]
fn invalid_transition_leaves_order_unchanged() {
    let mut order = sell_order(200_000);
    let err = order.transition(OrderStatus::Success).unwrap_err();

    assert!(matches!(
        err,
        EngineError::InvalidStateTransition {
            from: OrderStatus::Pending,
            to: OrderStatus::Success,
        }
    ));
    assert_eq!(order.status, OrderStatus::Pending);
}

#[test]
fn dispute_can_end_for_either_party() {
    // Buyer's favor: escrow settled, payout follows
    let mut order = taken_sell_order();
    order.transition(OrderStatus::WaitingPayment).unwrap();
    order.transition(OrderStatus::Active).unwrap();
    order.transition(OrderStatus::Dispute).unwrap();
    assert!(order.status.can_transition_to(OrderStatus::CompletedByAdmin));
    assert!(order.status.can_transition_to(OrderStatus::PaidHoldInvoice));

    // Seller's favor: escrow canceled back
    assert!(order.status.can_transition_to(OrderStatus::CanceledByAdmin));
    assert!(order.status.can_transition_to(OrderStatus::HoldInvoiceExpired));
}

#[test]
fn frozen_orders_only_resolve_administratively() {
    let mut order = taken_sell_order();
    order.transition(OrderStatus::WaitingPayment).unwrap();
    order.transition(OrderStatus::Active).unwrap();
    order.transition(OrderStatus::Frozen).unwrap();

    for to in OrderStatus::ALL {
        let allowed = matches!(to, OrderStatus::Success | OrderStatus::CanceledByAdmin);
        assert_eq!(order.status.can_transition_to(to), allowed);
    }
}

#[test]
fn cooperative_cancel_needs_both_parties() {
    let mut order = taken_sell_order();
    order.transition(OrderStatus::WaitingPayment).unwrap();
    order.transition(OrderStatus::Active).unwrap();

    assert_eq!(
        order.cooperative_cancel_outcome(TradeParty::Buyer),
        CoopCancelOutcome::CounterpartyNotified
    );

    order.buyer_cooperative_cancel = true;
    assert_eq!(
        order.cooperative_cancel_outcome(TradeParty::Buyer),
        CoopCancelOutcome::AlreadyRequested
    );
    assert_eq!(
        order.cooperative_cancel_outcome(TradeParty::Seller),
        CoopCancelOutcome::CancelNow
    );
}

#[test]
fn payout_amount_is_escrow_minus_frozen_fee() {
    let mut order = sell_order(200_000);
    order.fee = fee_for(order.amount, dec!(0.006));

    assert_eq!(order.fee, 1_200);
    assert_eq!(order.escrow_amount(), 200_000);
    assert_eq!(order.buyer_payout_amount(), 198_800);
}

#[test]
fn market_pricing_applies_margin_and_floors() {
    // 100 EUR at 50,000 EUR/BTC = 200,000 sats
    let base = market_sats(dec!(100), dec!(50_000), dec!(0)).unwrap();
    assert_eq!(base, 200_000);

    // A 2% premium for the maker lowers what the taker receives
    let discounted = market_sats(dec!(100), dec!(50_000), dec!(2)).unwrap();
    assert_eq!(discounted, 196_000);

    assert!(market_sats(dec!(100), dec!(0), dec!(0)).is_none());
}

#[test]
fn range_order_remainder_republishes_leftover_interval() {
    let mut order = sell_order(0);
    order.min_amount = Some(dec!(50));
    order.max_amount = Some(dec!(500));

    let (min, max) = order.range_remainder(dec!(100)).unwrap();
    assert_eq!(min, dec!(50));
    assert_eq!(max, dec!(400));

    // Nothing meaningful left below the minimum
    assert!(order.range_remainder(dec!(460)).is_none());
}
