//! Headless RelayDrop participant.
//!
//! The `relaydrop` binary runs one [`Session`](relaydrop_client::session::Session)
//! either as a sender (`send`) or a receiver (`receive`). Progress is reported
//! through `tracing`; there is no other presentation.
//!
//! The event handling is split from the runtime: [`SendTracker`] and
//! [`ReceiveTracker`] turn [`TransferEvent`](relaydrop_client::TransferEvent)s
//! into steps for the command loop, so they can be tested without a relay.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
pub mod output;
pub mod receive;
pub mod send;

pub use error::CliError;
pub use receive::{ReceiveOptions, ReceiveStep, ReceiveTracker, run_receive};
pub use send::{SendOptions, SendStep, SendTracker, run_send};
