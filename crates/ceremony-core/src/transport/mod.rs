//! Round message transport over the relay
//!
//! The [`Messenger`] is handed to the engine for outbound traffic; the
//! [`Puller`] drains the local inbox and feeds the engine's inbound hook.

mod messenger;
mod puller;

pub use messenger::{open_body, Messenger};
pub use puller::Puller;
