//! Engine metrics.
//!
//! Per-process counters for message pool pressure, fragmentation, parse
//! failures, and wire bytes. Exposed to whatever stats collaborator the
//! deployment wires up.

use metriken::{metric, Counter};

// ── Message pool ─────────────────────────────────────────────────

#[metric(
    name = "braid/messages/allocated",
    description = "Message shells allocated (not reused from the free list)"
)]
pub static MESSAGES_ALLOCATED: Counter = Counter::new();

#[metric(
    name = "braid/messages/denied_soft",
    description = "Non-forced acquires denied at the soft ceiling"
)]
pub static MESSAGES_DENIED_SOFT: Counter = Counter::new();

#[metric(
    name = "braid/messages/denied_hard",
    description = "Acquires denied at the hard ceiling"
)]
pub static MESSAGES_DENIED_HARD: Counter = Counter::new();

// ── Parsing ──────────────────────────────────────────────────────

#[metric(
    name = "braid/fragments/produced",
    description = "Sibling messages split off multi-key requests"
)]
pub static FRAGMENTS: Counter = Counter::new();

#[metric(
    name = "braid/parse_errors/client",
    description = "Malformed frames on client-plane connections"
)]
pub static PARSE_ERRORS_CLIENT: Counter = Counter::new();

#[metric(
    name = "braid/parse_errors/peer",
    description = "Malformed frames swallowed on replication-plane connections"
)]
pub static PARSE_ERRORS_PEER: Counter = Counter::new();

// ── Wire ─────────────────────────────────────────────────────────

#[metric(name = "braid/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "braid/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Timeouts ─────────────────────────────────────────────────────

#[metric(
    name = "braid/timeouts/armed",
    description = "Requests inserted into the timeout index"
)]
pub static TIMEOUTS_ARMED: Counter = Counter::new();
