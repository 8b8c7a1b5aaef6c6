//! The connection contract.
//!
//! The engine never owns sockets. Whatever the event layer hands to
//! [`Engine::msg_recv`](crate::Engine::msg_recv) and
//! [`Engine::msg_send`](crate::Engine::msg_send) implements this trait:
//! raw I/O, message-queue selection, and completion callbacks. The engine
//! drives; the connection decides which message to parse into, which to
//! write next, and what to do with finished frames.

use std::io::{self, IoSlice};
use std::time::Duration;

use crate::crypto::AesKey;
use crate::engine::Engine;
use crate::message::{ConnId, Family, MsgToken, Role};

pub trait Connection {
    fn id(&self) -> ConnId;
    fn family(&self) -> Family;
    /// True for peer-to-peer replication transports. Messages received here
    /// parse through the envelope parser and are acquired with `force`.
    fn replication(&self) -> bool;
    fn role(&self) -> Role;

    /// Per-connection request timeout; `None` or zero disables timeout
    /// tracking for requests forwarded on this connection.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Key for sealed envelope payloads arriving on this connection.
    fn aes_key(&self) -> Option<&AesKey> {
        None
    }

    /// Edge-triggered readability. The implementation clears this when a
    /// `recv` drains the socket (`WouldBlock`, short read, or EOF).
    fn recv_ready(&self) -> bool;
    fn set_recv_ready(&mut self, ready: bool);

    /// Edge-triggered writability; cleared by `sendv` on partial progress
    /// or `WouldBlock`.
    fn send_ready(&self) -> bool;
    fn set_send_ready(&mut self, ready: bool);

    /// Sticky transport error.
    fn err(&self) -> Option<io::ErrorKind>;
    fn set_err(&mut self, err: io::ErrorKind);

    /// Read into `buf`. `WouldBlock` means success with zero progress;
    /// `Ok(0)` means the peer closed (the implementation records EOF and
    /// clears readiness).
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// One scatter-gather write of `total` bytes across `iovs`.
    fn sendv(&mut self, iovs: &[IoSlice<'_>], total: usize) -> io::Result<usize>;

    /// Pick the inbound message to parse into, acquiring a fresh one from
    /// the engine when `alloc` is set and none is current.
    fn recv_next(&mut self, engine: &mut Engine, alloc: bool) -> Option<MsgToken>;

    /// Advance the send cursor and return the next outbound message.
    fn send_next(&mut self, engine: &mut Engine) -> Option<MsgToken>;

    /// A whole frame finished parsing. `next` carries the successor message
    /// (pipelined trailing bytes or a fragment sibling); the connection
    /// queues `msg` and continues receiving into `next`.
    fn recv_done(&mut self, engine: &mut Engine, msg: MsgToken, next: Option<MsgToken>);

    /// Every byte of `msg` has been written.
    fn send_done(&mut self, engine: &mut Engine, msg: MsgToken);

    /// Current send-cursor message.
    fn smsg(&self) -> Option<MsgToken>;
    fn set_smsg(&mut self, msg: Option<MsgToken>);
}
