#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client and server library for Rust.
//!
//! This crate provides a tokio-based implementation of the Plan 9 file protocol,
//! 9P2000. It contains the protocol engine only: the binary codec, message
//! framing, tag and fid bookkeeping, a client session and a server dispatch loop.
//! The name space a server exports is supplied by the user through the
//! [`srv::Filesystem`] trait.
//!
//! # Overview
//!
//! A 9P session is a sequence of request (`T`) and response (`R`) messages over a
//! byte stream. Every request carries a 16-bit tag chosen by the client and the
//! server answers with the same tag. Files are named by 32-bit fids, also chosen
//! by the client.
//!
//! # Getting Started
//!
//! To serve a name space:
//!
//! 1. Define a type to hold your per-fid state (or use `()`)
//! 2. Implement [`srv::Filesystem`] for your filesystem type
//! 3. Start the server with [`srv::srv_async`]
//!
//! # Example
//!
//! ```no_run
//! use plan9p::{srv::{Filesystem, Fid, srv_async}, Config, Fcall, Qid, QidType, Result};
//! use async_trait::async_trait;
//!
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type Fid = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &mut Fid<Self::Fid>,
//!         _afid: Option<&Fid<Self::Fid>>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> Result<Fcall> {
//!         Ok(Fcall::RAttach {
//!             qid: Qid { typ: QidType::DIR, version: 0, path: 0 },
//!         })
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     srv_async(MyFs, "tcp!127.0.0.1!564", Config::default()).await
//! }
//! ```
//!
//! A client session:
//!
//! ```no_run
//! use plan9p::{client::Client, Config, NOFID, om};
//!
//! # async fn run() -> plan9p::Result<()> {
//! let mut client = Client::dial("127.0.0.1:564", Config::default()).await?;
//! client.attach(0, NOFID, "glenda", "").await?;
//! client.walk(0, 1, &["lib", "motd"]).await?;
//! client.open(1, om::READ).await?;
//! let motd = client.read(1, 0, 8192).await?;
//! client.clunk(1).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Fid Management
//!
//! - Each fid is unique per connection
//! - Fids persist across operations until explicitly clunked or removed
//! - Walking to a new fid only binds it if every name resolved
//! - A fid can be opened once; read and write carry explicit offsets
//!
//! # Error Handling
//!
//! Filesystems refuse requests with [`Error::No`] and one of the Plan 9 error
//! strings in [`errstr`]. The server turns these into `Rerror` messages. Malformed
//! traffic is a protocol violation and ends the connection.
pub mod client;
pub mod config;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod framing;
pub mod serialize;
pub mod srv;
pub mod tag;
#[macro_use]
pub mod utils;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
