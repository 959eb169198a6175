//! Payment engine: checkout preparation, capture application, refunds,
//! webhook admission and reconciliation.
//!
//! Every path that changes payment state ends in the same compare-and-swap
//! transitions in [`capture`]. Gateway calls happen outside database
//! transactions; state changes happen inside them.

pub mod cancel;
pub mod capture;
pub mod checkout;
pub mod notification;
pub mod reconcile;
pub mod refund;
pub mod webhook;

pub use cancel::{cancel_attempt, close_attempt_for_ops};
pub use capture::{
    ApplyCaptureCommand, CaptureDisposition, CaptureOutcome, apply_capture_result, capture_attempt,
};
pub use checkout::{
    CheckoutPrepared, CheckoutStarted, CheckoutUrls, bind_external_order, prepare_checkout,
    start_checkout,
};
pub use notification::{WebhookOutcome, handle_webhook};
pub use reconcile::{scan, scan_refunds};
pub use refund::execute_refund;
pub use webhook::{Admission, WebhookGate, WebhookTicket};
