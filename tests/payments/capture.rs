//! Capture application: the attempt state machine and its order side effects.

#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use common::*;

#[test]
fn test_apply_success_settles_attempt_and_order() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");

    let outcome = apply_capture_result(&mut conn, &capture_success(&attempt, "CAP-1", CaptureSource::User))
        .expect("apply should succeed");
    assert_eq!(outcome.disposition, CaptureDisposition::Applied);
    assert_eq!(outcome.status, PaymentStatus::Success);
    assert!(outcome.refund_id.is_none());

    let attempt = get_attempt(&conn, &attempt.id);
    assert_eq!(attempt.status, PaymentStatus::Success);
    assert_eq!(attempt.capture_id.as_deref(), Some("CAP-1"));
    assert!(attempt.paid_at.is_some());

    let order = get_order(&conn, &order.id);
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.pay_status, PaymentStatus::Success);
    assert_eq!(order.payment_external_id.as_deref(), Some("EC-1"));
    assert_eq!(order.pay_time, attempt.paid_at);
}

#[test]
fn test_replayed_success_writes_nothing() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");

    apply_capture_result(&mut conn, &capture_success(&attempt, "CAP-1", CaptureSource::User)).unwrap();
    let settled = get_attempt(&conn, &attempt.id);

    let replay = apply_capture_result(&mut conn, &capture_success(&attempt, "CAP-1", CaptureSource::Webhook))
        .expect("replay should succeed");
    assert_eq!(replay.disposition, CaptureDisposition::AlreadySucceeded);

    // A different capture id never overwrites the recorded one
    let other = apply_capture_result(&mut conn, &capture_success(&attempt, "CAP-2", CaptureSource::Scheduler))
        .expect("conflicting replay should not error");
    assert_eq!(other.disposition, CaptureDisposition::AlreadySucceeded);

    let after = get_attempt(&conn, &attempt.id);
    assert_eq!(after.capture_id.as_deref(), Some("CAP-1"));
    assert_eq!(after.updated_at, settled.updated_at, "replay must not write");
    assert!(after.notify_payload.is_none());

    // A failure report after success is ignored too
    let failure = apply_capture_result(&mut conn, &capture_failure(&attempt, CaptureSource::Webhook)).unwrap();
    assert_eq!(failure.disposition, CaptureDisposition::AlreadySucceeded);
    assert_eq!(get_attempt(&conn, &attempt.id).status, PaymentStatus::Success);
}

#[test]
fn test_apply_failure() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");

    let outcome = apply_capture_result(&mut conn, &capture_failure(&attempt, CaptureSource::Webhook)).unwrap();
    assert_eq!(outcome.disposition, CaptureDisposition::Failed);
    assert_eq!(get_attempt(&conn, &attempt.id).status, PaymentStatus::Fail);

    let order = get_order(&conn, &order.id);
    assert_eq!(order.pay_status, PaymentStatus::Fail);
    assert_eq!(order.status, OrderStatus::PendingPayment, "order stays payable after a failure");

    // Repeated failure on a terminal attempt only records the evidence
    let again = apply_capture_result(&mut conn, &capture_failure(&attempt, CaptureSource::Webhook)).unwrap();
    assert_eq!(again.disposition, CaptureDisposition::AuditOnly);
}

#[test]
fn test_success_on_failed_attempt_queues_refund() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");
    apply_capture_result(&mut conn, &capture_failure(&attempt, CaptureSource::User)).unwrap();

    let outcome = apply_capture_result(&mut conn, &capture_success(&attempt, "CAP-9", CaptureSource::Scheduler))
        .unwrap();
    assert_eq!(outcome.disposition, CaptureDisposition::NotPayable);
    assert_eq!(outcome.status, PaymentStatus::Fail, "terminal attempt is never reopened");

    let refund_id = outcome.refund_id.expect("refund should be queued");
    let refund = queries::get_refund_attempt(&conn, &refund_id).unwrap().unwrap();
    assert_eq!(refund.status, RefundStatus::Init);
    assert_eq!(refund.capture_id.as_deref(), Some("CAP-9"));
    assert_eq!(refund.amount_minor, 1999);
    assert_eq!(refund.client_key, AUTO_REFUND_KEY);

    let order = get_order(&conn, &order.id);
    assert_ne!(order.status, OrderStatus::Paid);
}

#[test]
fn test_late_capture_is_quarantined() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");
    backdate_order(&conn, &order.id, 7200);

    let cmd = ApplyCaptureCommand {
        freshness_window_secs: Some(3600),
        ..capture_success(&attempt, "CAP-LATE", CaptureSource::Webhook)
    };
    let outcome = apply_capture_result(&mut conn, &cmd).unwrap();
    assert_eq!(outcome.disposition, CaptureDisposition::LatePayment);
    assert_eq!(outcome.status, PaymentStatus::Exception);

    let attempt = get_attempt(&conn, &attempt.id);
    assert_eq!(attempt.status, PaymentStatus::Exception);
    assert_eq!(attempt.capture_id.as_deref(), Some("CAP-LATE"));

    let order = get_order(&conn, &order.id);
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(order.pay_status, PaymentStatus::Pending, "late capture leaves pay_status alone");

    let refunds = queries::list_refunds_for_payment(&conn, &attempt.id).unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].reason.as_deref(), Some("late_payment"));

    // Replaying the late capture does not queue a second refund
    apply_capture_result(&mut conn, &cmd).unwrap();
    assert_eq!(queries::list_refunds_for_payment(&conn, &attempt.id).unwrap().len(), 1);
}

#[test]
fn test_capture_inside_window_is_applied() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");
    backdate_order(&conn, &order.id, 600);

    let cmd = ApplyCaptureCommand {
        freshness_window_secs: Some(3600),
        ..capture_success(&attempt, "CAP-1", CaptureSource::Webhook)
    };
    let outcome = apply_capture_result(&mut conn, &cmd).unwrap();
    assert_eq!(outcome.disposition, CaptureDisposition::Applied);

    let attempt = get_attempt(&conn, &attempt.id);
    assert!(attempt.notify_payload.is_none(), "no raw payload was supplied");
    assert!(attempt.last_notified_at.is_some(), "webhook source records notification time");
}

#[test]
fn test_capture_for_refunded_order_is_audit_only() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");
    conn.execute(
        "UPDATE orders SET status = 'refunded' WHERE id = ?1",
        rusqlite::params![&order.id],
    )
    .unwrap();

    let outcome = apply_capture_result(&mut conn, &capture_success(&attempt, "CAP-1", CaptureSource::Webhook))
        .unwrap();
    assert_eq!(outcome.disposition, CaptureDisposition::AuditOnly);

    let attempt = get_attempt(&conn, &attempt.id);
    assert_eq!(attempt.status, PaymentStatus::Pending);
    assert_eq!(attempt.capture_id.as_deref(), Some("CAP-1"));
    assert!(queries::list_refunds_for_payment(&conn, &attempt.id).unwrap().is_empty());
}

#[test]
fn test_apply_rejects_bad_input_before_writing() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let other_order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");

    let missing_capture = ApplyCaptureCommand {
        capture_id: None,
        ..capture_success(&attempt, "x", CaptureSource::User)
    };
    assert!(matches!(
        apply_capture_result(&mut conn, &missing_capture),
        Err(AppError::BadRequest(_))
    ));

    let missing_ids = ApplyCaptureCommand {
        attempt_id: " ".into(),
        ..capture_success(&attempt, "CAP-1", CaptureSource::User)
    };
    assert!(matches!(
        apply_capture_result(&mut conn, &missing_ids),
        Err(AppError::BadRequest(_))
    ));

    let wrong_order = ApplyCaptureCommand {
        order_id: other_order.id.clone(),
        ..capture_success(&attempt, "CAP-1", CaptureSource::User)
    };
    assert!(matches!(
        apply_capture_result(&mut conn, &wrong_order),
        Err(AppError::BadRequest(_))
    ));

    let wrong_external = ApplyCaptureCommand {
        external_id: Some("EC-OTHER".into()),
        ..capture_success(&attempt, "CAP-1", CaptureSource::Webhook)
    };
    assert!(matches!(
        apply_capture_result(&mut conn, &wrong_external),
        Err(AppError::Conflict(_))
    ));

    let missing_attempt = ApplyCaptureCommand {
        attempt_id: "pay_missing".into(),
        ..capture_success(&attempt, "CAP-1", CaptureSource::User)
    };
    assert!(matches!(
        apply_capture_result(&mut conn, &missing_attempt),
        Err(AppError::NotFound(_))
    ));

    assert_eq!(get_attempt(&conn, &attempt.id).status, PaymentStatus::Pending);
}

// ============ capture_attempt ============

#[tokio::test]
async fn test_capture_attempt_applies_completed_capture() {
    let ctx = TestContext::new();
    let (order, attempt) = {
        let mut conn = ctx.conn();
        let order = create_test_order(&conn, 1999, "USD");
        let attempt = create_bound_attempt(&mut conn, &order, "EC-1");
        (order, attempt)
    };
    ctx.gateway.script_capture(Ok(completed_order("EC-1", "CAP-1")));

    let outcome = capture_attempt(&ctx.state, Some(TEST_USER), &attempt.id, CaptureSource::User)
        .await
        .expect("capture should succeed");
    assert_eq!(outcome.disposition, CaptureDisposition::Applied);
    assert_eq!(
        ctx.gateway.capture_keys.lock().unwrap().as_slice(),
        &[format!("cap-{}", attempt.id)]
    );

    let conn = ctx.conn();
    let attempt = get_attempt(&conn, &attempt.id);
    assert_eq!(attempt.status, PaymentStatus::Success);
    assert_eq!(attempt.capture_id.as_deref(), Some("CAP-1"));
    assert!(attempt.response_payload.is_some());
    assert_eq!(get_order(&conn, &order.id).status, OrderStatus::Paid);

    // Second capture is answered locally
    let again = capture_attempt(&ctx.state, Some(TEST_USER), &attempt.id, CaptureSource::User)
        .await
        .unwrap();
    assert_eq!(again.disposition, CaptureDisposition::AlreadySucceeded);
    assert_eq!(MockGateway::calls(&ctx.gateway.capture_calls), 1);
}

#[tokio::test]
async fn test_capture_timeout_leaves_attempt_pending() {
    let ctx = TestContext::new();
    let attempt = {
        let mut conn = ctx.conn();
        let order = create_test_order(&conn, 1999, "USD");
        create_bound_attempt(&mut conn, &order, "EC-1")
    };
    ctx.gateway.script_capture(Err(GatewayError::timeout("capture")));

    let outcome = capture_attempt(&ctx.state, Some(TEST_USER), &attempt.id, CaptureSource::User)
        .await
        .expect("ambiguous outcome is not an error");
    assert_eq!(outcome.disposition, CaptureDisposition::Unresolved);

    let conn = ctx.conn();
    let attempt = get_attempt(&conn, &attempt.id);
    assert_eq!(attempt.status, PaymentStatus::Pending, "timeout must not be treated as failure");
    assert!(attempt.needs_reconcile);
    assert!(attempt.last_polled_at.is_some());
}

#[tokio::test]
async fn test_capture_definitive_rejection_is_an_error() {
    let ctx = TestContext::new();
    let attempt = {
        let mut conn = ctx.conn();
        let order = create_test_order(&conn, 1999, "USD");
        create_bound_attempt(&mut conn, &order, "EC-1")
    };

    // Unscripted capture answers 422
    let err = capture_attempt(&ctx.state, None, &attempt.id, CaptureSource::System)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Gateway(_)));
    assert_eq!(get_attempt(&ctx.conn(), &attempt.id).status, PaymentStatus::Pending);
}

#[tokio::test]
async fn test_capture_attempt_guards() {
    let ctx = TestContext::new();
    let (bound, unbound) = {
        let mut conn = ctx.conn();
        let order = create_test_order(&conn, 1999, "USD");
        let bound = create_bound_attempt(&mut conn, &order, "EC-1");
        let order2 = create_test_order(&conn, 500, "USD");
        let unbound = prepare_checkout(&mut conn, TEST_USER, &order2.id, PaymentChannel::ExternalWallet).unwrap();
        (bound, unbound)
    };

    let err = capture_attempt(&ctx.state, Some(OTHER_USER), &bound.id, CaptureSource::User)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = capture_attempt(&ctx.state, Some(TEST_USER), &unbound.attempt_id, CaptureSource::User)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    assert_eq!(MockGateway::calls(&ctx.gateway.capture_calls), 0);
}

#[tokio::test]
async fn test_capture_declined_and_voided() {
    let ctx = TestContext::new();
    let (declined, voided) = {
        let mut conn = ctx.conn();
        let o1 = create_test_order(&conn, 1000, "USD");
        let o2 = create_test_order(&conn, 1000, "USD");
        (
            create_bound_attempt(&mut conn, &o1, "EC-D"),
            create_bound_attempt(&mut conn, &o2, "EC-V"),
        )
    };
    ctx.gateway.script_capture(Ok(gateway_order(
        "EC-D",
        GatewayOrderStatus::Completed,
        Some(("CAP-D", CaptureStatus::Declined)),
    )));
    ctx.gateway
        .script_capture(Ok(gateway_order("EC-V", GatewayOrderStatus::Voided, None)));

    let outcome = capture_attempt(&ctx.state, None, &declined.id, CaptureSource::System).await.unwrap();
    assert_eq!(outcome.disposition, CaptureDisposition::Failed);

    let outcome = capture_attempt(&ctx.state, None, &voided.id, CaptureSource::System).await.unwrap();
    assert_eq!(outcome.disposition, CaptureDisposition::Closed);

    let conn = ctx.conn();
    assert_eq!(get_attempt(&conn, &declined.id).status, PaymentStatus::Fail);
    assert_eq!(get_attempt(&conn, &voided.id).status, PaymentStatus::Closed);
}

#[tokio::test]
async fn test_late_capture_issues_automatic_refund() {
    let ctx = TestContext::with_settings(PaymentSettings {
        freshness_window: Some(Duration::from_secs(3600)),
        ..PaymentSettings::default()
    });
    let attempt = {
        let mut conn = ctx.conn();
        let order = create_test_order(&conn, 2500, "EUR");
        let attempt = create_bound_attempt(&mut conn, &order, "EC-L");
        backdate_order(&conn, &order.id, 2 * 3600);
        attempt
    };
    ctx.gateway.script_capture(Ok(completed_order("EC-L", "CAP-L")));

    let outcome = capture_attempt(&ctx.state, None, &attempt.id, CaptureSource::Scheduler)
        .await
        .unwrap();
    assert_eq!(outcome.disposition, CaptureDisposition::LatePayment);
    let refund_id = outcome.refund_id.expect("refund queued");

    assert_eq!(MockGateway::calls(&ctx.gateway.refund_calls), 1);
    assert_eq!(
        ctx.gateway.refund_keys.lock().unwrap().as_slice(),
        &[format!("rfd-{}", refund_id)]
    );

    let conn = ctx.conn();
    let refund = queries::get_refund_attempt(&conn, &refund_id).unwrap().unwrap();
    assert_eq!(refund.status, RefundStatus::Success);
    assert_eq!(refund.external_refund_id, Some(format!("RF-rfd-{}", refund_id)));
    assert_eq!(get_attempt(&conn, &attempt.id).status, PaymentStatus::Exception);
}
