//! One-shot JSON request/response client.
//!
//! Each exchange opens one TCP or Unix domain socket connection, writes a single JSON envelope
//! (`method`, `params`, `param_types`, `id`), waits for one reply and closes the connection.
//! The result is always exactly one [`Outcome`]: the reply payload, a disconnect without reply, or
//! a transport error.
//!
//! To run an exchange:
//! 1. Build an [`Envelope`] with `Envelope::build(method, params, param_types)`
//! 2. Create a [`Client`] for an [`Address`], or load one from a [`Config`]
//! 3. Call `client.execute(envelope)`
//!
//! A small reference [`Server`] is included that answers every envelope through a [`Handler`].
//!
//! Uses `tokio` for async I/O and `serde_json` for serialization.

mod config;
mod connection;
mod error;
mod message;
mod transport;

pub use config::*;
pub use connection::*;
pub use error::*;
pub use message::*;
pub use transport::*;
