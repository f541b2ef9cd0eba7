#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client library for Rust.
//!
//! This crate provides a tokio-based client for the 9P2000 protocol: a wire
//! codec for every message type, a connection that multiplexes any number of
//! concurrent requests over one byte stream, session establishment and a
//! small file-tree interface on top.
//!
//! # Overview
//!
//! 9P is the file protocol of the Plan 9 distributed operating system. A
//! client talks to a file server over a single bidirectional stream. Every
//! request carries a 16-bit *tag* chosen by the client and the server echoes
//! it in the response, so many requests can be outstanding at once and their
//! responses may arrive in any order.
//!
//! # Getting Started
//!
//! 1. Dial a service with [`session::dial_fs`] (or [`session::dial`] plus
//!    [`ClientConn::attach_root`] for the raw connection)
//! 2. Open files through [`fs::Fs`] or drive [`ClientConn`] directly
//! 3. Pass a [`context::Context`] to every operation to cancel it or give it
//!    a deadline
//!
//! # Example
//!
//! ```no_run
//! use ninep::{context::Context, session::{dial_fs, DialFsOptions}, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let fs = dial_fs("tcp!127.0.0.1!564", &DialFsOptions::default()).await?;
//!     let ctx = Context::background();
//!
//!     let mut file = fs.open(&ctx, "lib/namespace").await?;
//!     let data = file.read_to_end(&ctx).await?;
//!     println!("{}", String::from_utf8_lossy(&data));
//!     file.close(&ctx).await?;
//!
//!     for entry in fs.read_dir(&ctx, "").await? {
//!         println!("{} {:>8} {}", entry.mode_string(), entry.length, entry.name);
//!     }
//!     fs.close(&ctx).await
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Message Flow
//!
//! 1. **Version Negotiation**: `Tversion` with tag `NOTAG`. The server may
//!    lower `msize` but never raise it, and must agree on `9P2000` exactly
//! 2. **Authentication** (optional): `Tauth`, then an exchange over the auth
//!    fid run by an [`session::Authenticator`]
//! 3. **Attach**: `Tattach` binds the root fid
//! 4. **Operations**: `walk`, `open`, `read`, `write`, `stat`, ...
//! 5. **Cleanup**: `Tclunk` releases fids
//!
//! ## Tags and Cancellation
//!
//! Tags come from a bounded pool; when all are in use new requests wait. A
//! tag is only reused once its response has been received. When an operation
//! is canceled or its deadline passes, the client sends `Tflush` for the
//! abandoned tag and keeps the tag until the server answers the flush.
//!
//! ## Fid Management
//!
//! Fids are chosen by the client. The facade allocates them from the
//! connection's pool and clunks them when files are closed.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` or `"host:port"`
//! - **Unix Domain Sockets**: `"unix!path!suffix"`
//! - **plan9port services**: a bare name such as `"acme"` is looked up in
//!   `/tmp/ns.$USER.$DISPLAY`
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod client;
pub mod context;
pub mod error;
pub mod fcall;
pub mod fs;
pub mod pool;
pub mod serialize;
pub mod session;
pub mod transport;
#[macro_use]
pub mod utils;

#[cfg(test)]
mod mock;

pub use crate::client::ClientConn;
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
