//! Checkout preparation and gateway order binding.

#[path = "../common/mod.rs"]
mod common;

use common::*;

#[test]
fn test_prepare_checkout_is_idempotent() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "usd");

    let first = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet)
        .expect("first prepare should succeed");
    let second = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet)
        .expect("second prepare should succeed");

    assert_eq!(first.attempt_id, second.attempt_id, "same attempt should be reused");
    assert_eq!(first.status, PaymentStatus::Init);
    assert_eq!(first.amount_minor, 1999);
    assert_eq!(first.currency, "USD", "currency is stored upper-case");

    let attempts = queries::list_payment_attempts_for_order(&conn, &order.id).unwrap();
    assert_eq!(attempts.len(), 1);

    let order = get_order(&conn, &order.id);
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(order.pay_status, PaymentStatus::Init);
    assert_eq!(order.pay_channel, Some(PaymentChannel::ExternalWallet));
}

#[test]
fn test_prepare_checkout_upgrades_placeholder() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let (order, placeholder) = create_order_with_placeholder(&conn, 500);

    let prepared = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet)
        .expect("prepare should succeed");

    assert_eq!(prepared.attempt_id, placeholder.id, "placeholder should be reused");
    let attempt = get_attempt(&conn, &placeholder.id);
    assert_eq!(attempt.status, PaymentStatus::Init);
    assert_eq!(attempt.channel, PaymentChannel::ExternalWallet);
    assert_eq!(
        queries::list_payment_attempts_for_order(&conn, &order.id).unwrap().len(),
        1,
        "no extra attempt should be inserted"
    );
}

#[test]
fn test_channel_switch_closes_other_channel_attempts() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1000, "USD");

    let wallet = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet).unwrap();
    let card = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::Card).unwrap();

    assert_ne!(wallet.attempt_id, card.attempt_id);
    assert_eq!(get_attempt(&conn, &wallet.attempt_id).status, PaymentStatus::Closed);
    assert_eq!(get_attempt(&conn, &card.attempt_id).status, PaymentStatus::Init);

    let active: Vec<_> = queries::list_payment_attempts_for_order(&conn, &order.id)
        .unwrap()
        .into_iter()
        .filter(|a| a.status.is_active())
        .collect();
    assert_eq!(active.len(), 1, "at most one attempt may be active per order");
    assert_eq!(get_order(&conn, &order.id).pay_channel, Some(PaymentChannel::Card));
}

#[test]
fn test_changed_order_amount_replaces_attempt() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1000, "USD");

    let before = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet).unwrap();
    conn.execute(
        "UPDATE orders SET amount_minor = 1500 WHERE id = ?1",
        rusqlite::params![&order.id],
    )
    .unwrap();
    let after = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet).unwrap();

    assert_ne!(before.attempt_id, after.attempt_id);
    assert_eq!(after.amount_minor, 1500);
    assert_eq!(get_attempt(&conn, &before.attempt_id).status, PaymentStatus::Closed);
}

#[test]
fn test_prepare_checkout_rejects_paid_and_cancelled_orders() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();

    let paid = create_test_order(&conn, 1000, "USD");
    queries::mark_order_paid(&conn, &paid.id, PaymentChannel::ExternalWallet, Some("EC-X"), 1).unwrap();
    let err = prepare_checkout(&mut conn, TEST_USER, &paid.id, PaymentChannel::ExternalWallet).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "paid order should conflict, got {:?}", err);

    let cancelled = create_test_order(&conn, 1000, "USD");
    conn.execute(
        "UPDATE orders SET status = 'cancelled' WHERE id = ?1",
        rusqlite::params![&cancelled.id],
    )
    .unwrap();
    let err = prepare_checkout(&mut conn, TEST_USER, &cancelled.id, PaymentChannel::ExternalWallet).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "cancelled order should conflict, got {:?}", err);

    assert!(
        queries::list_payment_attempts_for_order(&conn, &cancelled.id).unwrap().is_empty(),
        "rejected checkout must not create attempts"
    );
}

#[test]
fn test_prepare_checkout_validates_caller_and_channel() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1000, "USD");

    let err = prepare_checkout(&mut conn, OTHER_USER, &order.id, PaymentChannel::ExternalWallet).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "non-owner should see not found");

    let err = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::None).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = prepare_checkout(&mut conn, TEST_USER, "ord_missing", PaymentChannel::ExternalWallet).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[test]
fn test_bind_external_order() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1000, "USD");
    let prepared = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet).unwrap();

    let bound = bind_external_order(&mut conn, &prepared.attempt_id, "EC-1", Some("{}"), Some("{}"))
        .expect("bind should succeed");
    assert_eq!(bound.status, PaymentStatus::Pending);
    assert_eq!(bound.external_id.as_deref(), Some("EC-1"));

    // Same id again is a no-op
    bind_external_order(&mut conn, &prepared.attempt_id, "EC-1", None, None)
        .expect("rebinding the same id should succeed");

    let err = bind_external_order(&mut conn, &prepared.attempt_id, "EC-2", None, None).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "a different id must not overwrite");

    let order = get_order(&conn, &order.id);
    assert_eq!(order.pay_status, PaymentStatus::Pending);
    assert_eq!(order.payment_external_id.as_deref(), Some("EC-1"));

    // Re-preparing returns the bound attempt
    let again = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet).unwrap();
    assert_eq!(again.attempt_id, prepared.attempt_id);
    assert_eq!(again.external_id.as_deref(), Some("EC-1"));
}

#[test]
fn test_bind_closes_attempt_when_order_stopped_being_payable() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1000, "USD");
    let prepared = prepare_checkout(&mut conn, TEST_USER, &order.id, PaymentChannel::ExternalWallet).unwrap();

    conn.execute(
        "UPDATE orders SET status = 'closed' WHERE id = ?1",
        rusqlite::params![&order.id],
    )
    .unwrap();

    let err = bind_external_order(&mut conn, &prepared.attempt_id, "EC-1", None, None).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let attempt = get_attempt(&conn, &prepared.attempt_id);
    assert_eq!(attempt.status, PaymentStatus::Closed);
    assert!(attempt.external_id.is_none());
}

#[tokio::test]
async fn test_start_checkout_creates_gateway_order_once() {
    let ctx = TestContext::new();
    let order = {
        let conn = ctx.conn();
        create_test_order(&conn, 1999, "USD")
    };

    let first = start_checkout(&ctx.state, TEST_USER, &order.id, &CheckoutUrls::default())
        .await
        .expect("start_checkout should succeed");
    assert_eq!(first.external_id, format!("EC-{}", first.attempt_id));
    assert!(first.approve_url.contains(&first.external_id));

    let second = start_checkout(&ctx.state, TEST_USER, &order.id, &CheckoutUrls::default())
        .await
        .expect("second start_checkout should succeed");
    assert_eq!(second.attempt_id, first.attempt_id);
    assert_eq!(second.external_id, first.external_id);
    assert!(
        second.approve_url.ends_with(&first.external_id),
        "falls back to the configured approve page"
    );

    assert_eq!(MockGateway::calls(&ctx.gateway.create_calls), 1, "gateway order created once");
    assert_eq!(
        ctx.gateway.create_keys.lock().unwrap().as_slice(),
        &[format!("co-{}", first.attempt_id)]
    );

    let conn = ctx.conn();
    let attempt = get_attempt(&conn, &first.attempt_id);
    assert_eq!(attempt.status, PaymentStatus::Pending);
    assert!(attempt.request_payload.is_some());
    assert!(attempt.response_payload.is_some());
}

#[tokio::test]
async fn test_start_checkout_gateway_failure_leaves_attempt_unbound() {
    let ctx = TestContext::new();
    let order = {
        let conn = ctx.conn();
        create_test_order(&conn, 1999, "USD")
    };
    ctx.gateway
        .script_create(Err(GatewayError::http("create_order", 400, "INVALID_REQUEST")));

    let err = start_checkout(&ctx.state, TEST_USER, &order.id, &CheckoutUrls::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Gateway(_)));

    let conn = ctx.conn();
    let attempts = queries::list_payment_attempts_for_order(&conn, &order.id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, PaymentStatus::Init);
    assert!(attempts[0].external_id.is_none());
}
