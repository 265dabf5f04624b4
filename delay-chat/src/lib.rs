//! Line-oriented chat server with offline delivery.
//!
//! Clients log in to a statically configured account, then exchange direct
//! (`PRIVMSG`) and channel (`CHANMSG`) messages. Messages for an offline
//! account that opted in are queued and replayed on its next login.
//!
//! - [`message`] encodes and decodes the tab-separated `KEY=VALUE` lines.
//! - [`codec`] frames the byte stream into lines for `tokio_util`.
//! - [`error`] defines the error kinds reported back to clients.
//! - [`config`] loads the account and channel list.
//! - [`directory`] holds accounts, channels, and offline queues.
//! - [`session`] tracks one connection and the account it is bound to.
//! - [`commands`] maps command names to handlers.
//! - [`delivery`] fans messages out and runs the login burst.
//! - [`server`] accepts connections and drives each one.
//! - [`cli`] parses the command-line interface.

pub mod cli;
pub mod codec;
pub mod commands;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod message;
pub mod server;
pub mod session;
