//! In-process query event hub.
//!
//! - [`QueryBus`] fans every [`QueryEvent`](querylens_core::query::QueryEvent)
//!   out to synchronous listeners and to a broadcast tap.
//! - [`QueryTrace`] drains the tap into the diagnostic log.

pub mod bus;
pub mod trace;

pub use bus::{QueryBus, SubscriptionId};
pub use trace::QueryTrace;
