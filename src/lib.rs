//! Core of a reactive, non-blocking MongoDB driver.
//! - BSON codec built over a rope buffer: documents are encoded straight
//!   into chunk lists and parsed in place on inbound frames
//! - legacy wire protocol (OP_UPDATE through OP_KILL_CURSORS, OP_REPLY)
//! - one owning task per connection, pipelining requests and correlating
//!   replies by id
//! - per-endpoint supervisors with reconnect/backoff and bounded shutdown
//! - server cursors exposed as demand-driven streams
//!
//! Higher layers (client façades, query builders, URI parsing, auth, TLS)
//! sit on top of [`Driver`], [`Supervisor`] and the [`protocol`] types.

pub mod bson;
pub mod config;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod rope;

mod connection;
mod supervisor;

pub use config::Config;
pub use cursor::CursorStream;
pub use driver::Driver;
pub use error::{DecodeError, EncodeError, Error, Result};
pub use supervisor::Supervisor;
