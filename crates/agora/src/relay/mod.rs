//! Relay of messages and reactions between the channels of a hub.
//!
//! Inbound events arrive from a [`ChatGateway`] adapter, are resolved to
//! their hub by the [`RelayDispatcher`] and fanned out to every other
//! member channel.

pub mod dispatcher;
pub mod events;
pub mod format;
pub mod gateway;
pub mod runner;
pub mod stdio;

pub use dispatcher::{Delivery, DispatchConfig, DispatchOutcome, FanoutReport, RelayDispatcher};
pub use events::{Author, PostedMessage, Reaction, RelayEvent};
pub use gateway::{ChatGateway, SendError};
pub use runner::{RelayStats, run_relay};
pub use stdio::{StdioGateway, read_events, spawn_stdin_reader};
