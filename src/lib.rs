//! braid — message engine for a thin replication proxy.
//!
//! braid is the message-processing core of a replication proxy that sits
//! in front of single-node key-value stores speaking either a text-line
//! protocol (memcache ASCII) or a length-prefixed inline protocol (RESP).
//! It owns the in-flight message representation and everything that moves
//! bytes through it: pooled segment chains, incremental parsing across
//! read boundaries, multi-key fragmentation with response coalescing
//! hooks, scatter-gather writes, and the per-request timeout index.
//!
//! The surrounding proxy — accept loop, event loop, routing, topology —
//! stays outside. Connections reach the engine through the
//! [`Connection`] contract; one [`Engine`] serves one event loop, with no
//! shared state between loops.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use braid::{Config, Engine};
//!
//! let mut _engine = Engine::new(Config::default())?;
//! // For each readable connection the event loop owns:
//! //     engine.msg_recv(&mut conn)?;
//! // For each writable connection:
//! //     engine.msg_send(&mut conn)?;
//! // Each tick, time out the earliest outstanding request:
//! //     if let Some((msg, deadline)) = engine.msg_tmo_min() { /* ... */ }
//! # Ok::<(), braid::Error>(())
//! ```

// ── Internal modules ────────────────────────────────────────────────────
mod engine;
mod parse;
mod pool;
mod recv;
mod send;

// ── Public modules ──────────────────────────────────────────────────────
pub mod buf;
pub mod chain;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod message;
pub mod metrics;
pub mod proto;
pub mod timeout;

/// Engine configuration.
pub use config::Config;
/// The contract a connection implements to be driven by the engine.
pub use connection::Connection;
/// Key for sealed replication payloads.
pub use crypto::AesKey;
/// Per-loop engine state and drivers.
pub use engine::{Engine, ErrorSource};
/// Inter-node envelope attached to replication-plane messages.
pub use envelope::Dmsg;
/// Engine error taxonomy.
pub use error::Error;
/// Message state and identity types.
pub use message::{ConnId, Family, Msg, MsgKind, MsgToken, ParseResult, Role};
/// Protocol-family adapter seam.
pub use proto::Protocol;
