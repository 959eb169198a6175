mod order;
mod payment_attempt;
mod refund;

pub use order::*;
pub use payment_attempt::*;
pub use refund::*;
