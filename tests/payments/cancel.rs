//! User cancellation and operational close.

#[path = "../common/mod.rs"]
mod common;

use common::*;

#[test]
fn test_cancel_closes_attempt_and_is_idempotent() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");

    let closed = cancel_attempt(&mut conn, TEST_USER, &attempt.id).expect("cancel should succeed");
    assert_eq!(closed.status, PaymentStatus::Closed);
    assert_eq!(get_order(&conn, &order.id).pay_status, PaymentStatus::Closed);

    let again = cancel_attempt(&mut conn, TEST_USER, &attempt.id).expect("second cancel is a no-op");
    assert_eq!(again.status, PaymentStatus::Closed);
}

#[test]
fn test_cancel_never_reopens_success() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");
    apply_capture_result(&mut conn, &capture_success(&attempt, "CAP-1", CaptureSource::User)).unwrap();

    let err = cancel_attempt(&mut conn, TEST_USER, &attempt.id).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(get_attempt(&conn, &attempt.id).status, PaymentStatus::Success);
    assert_eq!(get_order(&conn, &order.id).pay_status, PaymentStatus::Success);
}

#[test]
fn test_cancel_rejects_other_users_and_failed_attempts() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");

    let err = cancel_attempt(&mut conn, OTHER_USER, &attempt.id).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    apply_capture_result(&mut conn, &capture_failure(&attempt, CaptureSource::Webhook)).unwrap();
    let err = cancel_attempt(&mut conn, TEST_USER, &attempt.id).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(get_attempt(&conn, &attempt.id).status, PaymentStatus::Fail);
}

#[test]
fn test_close_for_ops_is_silent_on_terminal_attempts() {
    let ctx = TestContext::new();
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");

    let closed = close_attempt_for_ops(&mut conn, &attempt.id).unwrap();
    assert_eq!(closed.status, PaymentStatus::Closed);

    let again = close_attempt_for_ops(&mut conn, &attempt.id).unwrap();
    assert_eq!(again.status, PaymentStatus::Closed);

    let paid_order = create_test_order(&conn, 1000, "USD");
    let paid = create_bound_attempt(&mut conn, &paid_order, "EC-2");
    apply_capture_result(&mut conn, &capture_success(&paid, "CAP-2", CaptureSource::User)).unwrap();
    let untouched = close_attempt_for_ops(&mut conn, &paid.id).unwrap();
    assert_eq!(untouched.status, PaymentStatus::Success);
}
