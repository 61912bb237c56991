//! Line-oriented chat relay: one server fans text out to many clients, and
//! both ends have an operator console that takes `#` commands.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`command`] tokenizes console lines and client frames into typed commands.
//! - [`message`] defines the JSON-lines wire frames.
//! - [`transport`] is the contract the engines program against; [`tcp`]
//!   implements it on Tokio sockets.
//! - [`registry`] tracks live connections and their login IDs.
//! - [`server`] and [`client`] hold the protocol engines and the console loops
//!   that drive them.
//! - [`console`] is where operator-facing output goes.

pub mod cli;
pub mod client;
pub mod command;
pub mod console;
pub mod message;
pub mod registry;
pub mod server;
pub mod tcp;
pub mod transport;
