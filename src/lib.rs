//!
//! ## spamd-client
//!
//! Client library for the SpamAssassin spamd daemon speaking the SPAMC/1.5
//! wire protocol over unix domain sockets, TCP, or TCP with TLS.
//!

pub mod config;
pub mod error;
pub mod protocol;

pub mod backend;

pub use config::{Config, Network};
pub use error::SpamdError;
pub use protocol::codec::StatusCode;
pub use protocol::commands::{MessageClass, SpamdCommand, TellAction};
pub use protocol::reply::{HeaderMap, Message, Rule, SpamdReply};

#[cfg(feature = "sync")]
pub use backend::sync_client::SyncClient;

#[cfg(feature = "async")]
pub use backend::async_client::AsyncClient;
