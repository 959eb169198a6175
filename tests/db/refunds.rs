//! Refund rows: dedupe by client key and conditional updates.

#[path = "../common/mod.rs"]
mod common;

use common::*;
use paysettle::db::queries::NewRefund;

fn settled_attempt(ctx: &TestContext) -> PaymentAttempt {
    let mut conn = ctx.conn();
    let order = create_test_order(&conn, 1999, "USD");
    let attempt = create_bound_attempt(&mut conn, &order, "EC-1");
    apply_capture_result(&mut conn, &capture_success(&attempt, "CAP-1", CaptureSource::User)).unwrap();
    get_attempt(&conn, &attempt.id)
}

fn new_refund<'a>(client_key: &'a str, amount_minor: i64, status: RefundStatus) -> NewRefund<'a> {
    NewRefund {
        client_key,
        external_refund_id: None,
        capture_id: Some("CAP-1"),
        amount_minor,
        currency: "USD",
        status,
        reason: Some("test"),
        response_payload: None,
    }
}

#[test]
fn test_insert_is_deduplicated_by_client_key() {
    let ctx = TestContext::new();
    let attempt = settled_attempt(&ctx);
    let conn = ctx.conn();

    let (first, created) =
        queries::insert_refund_if_absent(&conn, &attempt, &new_refund("auto", 1999, RefundStatus::Init)).unwrap();
    assert!(created);

    let (second, created) =
        queries::insert_refund_if_absent(&conn, &attempt, &new_refund("auto", 500, RefundStatus::Init)).unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);
    assert_eq!(second.amount_minor, 1999, "the first row is kept as-is");
    assert_eq!(queries::list_refunds_for_payment(&conn, &attempt.id).unwrap().len(), 1);
}

#[test]
fn test_update_is_compare_and_swap_and_keeps_first_external_id() {
    let ctx = TestContext::new();
    let attempt = settled_attempt(&ctx);
    let conn = ctx.conn();
    let (refund, _) =
        queries::insert_refund_if_absent(&conn, &attempt, &new_refund("auto", 1999, RefundStatus::Init)).unwrap();

    assert!(
        queries::try_update_refund(&conn, &refund.id, RefundStatus::Init, RefundStatus::Pending, Some("RF-1"), None)
            .unwrap()
    );
    assert!(
        !queries::try_update_refund(&conn, &refund.id, RefundStatus::Init, RefundStatus::Fail, Some("RF-X"), None)
            .unwrap()
    );
    assert!(
        queries::try_update_refund(&conn, &refund.id, RefundStatus::Pending, RefundStatus::Success, Some("RF-2"), None)
            .unwrap()
    );

    let stored = queries::get_refund_attempt(&conn, &refund.id).unwrap().unwrap();
    assert_eq!(stored.status, RefundStatus::Success);
    assert_eq!(stored.external_refund_id.as_deref(), Some("RF-1"));
    assert!(queries::get_refund_by_external_id(&conn, "RF-1").unwrap().is_some());
}

#[test]
fn test_open_refunds_and_successful_sum() {
    let ctx = TestContext::new();
    let attempt = settled_attempt(&ctx);
    let conn = ctx.conn();

    queries::insert_refund_if_absent(&conn, &attempt, &new_refund("a", 500, RefundStatus::Success)).unwrap();
    queries::insert_refund_if_absent(&conn, &attempt, &new_refund("b", 300, RefundStatus::Success)).unwrap();
    queries::insert_refund_if_absent(&conn, &attempt, &new_refund("c", 700, RefundStatus::Fail)).unwrap();
    let (open, _) =
        queries::insert_refund_if_absent(&conn, &attempt, &new_refund("d", 100, RefundStatus::Pending)).unwrap();

    assert_eq!(queries::sum_successful_refunds(&conn, &attempt.id).unwrap(), 800);

    let listed = queries::list_open_refunds(&conn, 10).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, open.id);
}
