//! Paysettle - payment capture and reconciliation engine
//!
//! Prepares checkouts against an external payment gateway, applies capture
//! results from users, webhooks and the reconciliation scanner through one
//! compare-and-swap state machine, and refunds money that arrives for orders
//! that can no longer take it.

pub mod config;
pub mod db;
pub mod dedupe;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod id;
pub mod models;
pub mod payments;
