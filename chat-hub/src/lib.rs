//! Multi-client TCP chat hub with accounts, history and search.
//!
//! Clients speak newline-delimited JSON packets over plain TCP. The server
//! keeps accounts and the message log in memory, snapshots both to JSON files
//! under the data directory, and fans every chat message out to all live
//! connections.
//!
//! - [`protocol`] defines the wire packets and the line framing helpers.
//! - [`store`] owns accounts and the message log, with JSON snapshots on disk.
//! - [`hub`] is the single task that tracks live connections and broadcasts.
//! - [`pool`] persists chat messages on a fixed set of workers.
//! - [`connection`] runs the inbound and outbound halves of one client.
//! - [`session`] authenticates connections and handles each request.
//! - [`server`] binds the listener, accepts connections and shuts down cleanly.
//! - [`config`] and [`cli`] describe how the binary is configured.
//! - [`client`] is the interactive line client.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod hub;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;
