#![forbid(unsafe_code)]
//! Asynchronous 9P2000 server library for Rust.
//!
//! This crate provides a tokio-based implementation of the server side of the
//! plain 9P2000 protocol: the wire codec, a per-connection fid table and a
//! dispatcher that hands each request to a [`srv::Filesystem`].
//!
//! # Getting Started
//!
//! 1. Implement the [`srv::Filesystem`] trait, overriding the operations your
//!    tree supports. Everything else answers with an error.
//! 2. Track fids through the [`session::Conn`] passed to each call.
//! 3. Start the server with [`srv::srv_async`] or [`srv::serve_tcp`].
//!
//! # Example
//!
//! ```no_run
//! use kv9p::{FCall, Qid, QidType, Result, session::{Binding, Conn}, srv::{Filesystem, srv_async}};
//! use async_trait::async_trait;
//!
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     async fn rattach(&self, conn: &Conn, fid: u32, _afid: u32, _uname: &str, _aname: &str) -> Result<FCall> {
//!         let qid = Qid { typ: QidType::DIR, version: 1, path: 0 };
//!         conn.attach(fid, Binding::new(qid, Vec::new())).await;
//!         Ok(FCall::RAttach { qid })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(MyFs, "tcp!127.0.0.1!5640").await
//! }
//! ```
//!
//! # Message Flow
//!
//! 1. **Version**: the client sends `Tversion` and gets its own `msize` and
//!    version string back. There is no negotiation.
//! 2. **Authentication**: `Tauth` fails with "auth not required" unless the
//!    filesystem overrides [`srv::Filesystem::rauth`].
//! 3. **Attach**: `Tattach` creates the connection's session and binds the root.
//! 4. **Operations**: walk, open, read, stat and friends.
//! 5. **Cleanup**: `Tclunk` releases a fid. Closing the connection releases all of them.
//!
//! Requests are handled concurrently. Replies may go out in any order but each
//! one is written as a whole frame.
//!
//! # Error Handling
//!
//! Handlers return [`Error`]; the dispatcher sends its [`Error::ename`] to the
//! client in `Rerror` and keeps the connection open. Only transport failures
//! close a connection, and they are reported through
//! [`srv::Filesystem::conn_error`].
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"`, `"host:port"` or `"*"`
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
#[macro_use]
pub mod utils;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod session;
pub mod srv;

pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
