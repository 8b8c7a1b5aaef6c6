//! The in-flight message.
//!
//! A [`Msg`] carries the parsing and I/O state for one request or response:
//! the segment chain holding its wire bytes, the parser cursor and scratch,
//! the decoded command fields, fragment-group membership, and the timeout
//! membership key. Cross-message references — the request/response peer and
//! the fragment-group owner — are pool tokens, never owning pointers; the
//! pool's slot generation catches stale tokens.

use crate::chain::MbufChain;
use crate::envelope::Dmsg;
use crate::timeout::TmoKey;

/// Stable handle to a pooled message: slot index plus the slot generation
/// at acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgToken {
    pub(crate) idx: u32,
    pub(crate) gen: u32,
}

/// Opaque identity of a connection, assigned by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// Wire protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Text-line key-value protocol (memcache ASCII).
    Memcache,
    /// Length-prefixed inline protocol (RESP).
    Resp,
}

/// Connection role relative to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// External client talking to the proxy.
    Client,
    /// The proxy's own listening side.
    Proxy,
    /// Backend storage server.
    Server,
}

/// Outcome of one parser invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// A whole frame was parsed; `pos` sits one past its final byte.
    Ok,
    /// A multi-key request must split at `pos`.
    Fragment,
    /// A token straddles a full segment; split at `pos` so the next read
    /// lands contiguously with the unparsed bytes.
    Repair,
    /// More bytes needed.
    Again,
    /// Malformed frame.
    Error,
}

/// Decoded message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Unknown,
    // Memcache requests.
    McGet,
    McGets,
    McSet,
    McAdd,
    McReplace,
    McDelete,
    McQuit,
    // Memcache responses.
    McValue,
    McEnd,
    McStored,
    McNotStored,
    McDeleted,
    McNotFound,
    McError,
    McClientError,
    McServerError,
    // RESP requests.
    RespGet,
    RespMget,
    RespSet,
    RespDel,
    RespQuit,
    // RESP responses.
    RespStatus,
    RespError,
    RespInteger,
    RespBulk,
    RespMultibulk,
}

impl MsgKind {
    /// Whether the decoded command only reads data (drives the caller's
    /// replication policy).
    pub fn is_read(&self) -> bool {
        !matches!(
            self,
            MsgKind::McSet
                | MsgKind::McAdd
                | MsgKind::McReplace
                | MsgKind::McDelete
                | MsgKind::RespSet
                | MsgKind::RespDel
        )
    }

    /// Whether this request kind fragments per key.
    pub fn fragments(&self) -> bool {
        matches!(
            self,
            MsgKind::McGet | MsgKind::McGets | MsgKind::RespMget | MsgKind::RespDel
        )
    }
}

/// Parser scratch persisted between invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// At a token boundary.
    Start,
    /// Consuming a value body (plus its trailing CRLF) that may span
    /// segments; `remaining` counts down to zero.
    ValueBody { remaining: usize },
    /// Replication envelope header parsed; payload pending.
    Envelope,
}

pub struct Msg {
    /// Monotonically increasing id assigned at acquisition.
    pub id: u64,
    /// Connection that produced (requests) or consumes (responses) this
    /// message.
    pub owner: ConnId,
    /// Paired message on the opposite side of the proxy. Weak.
    pub peer: Option<MsgToken>,
    pub request: bool,
    pub family: Family,
    /// Travels on the peer-to-peer replication plane; parsed through the
    /// envelope parser.
    pub replication: bool,

    pub chain: MbufChain,
    /// Receive/parse-side byte count; kept equal to the chain's readable
    /// length until the send driver starts consuming segments.
    pub mlen: u32,
    /// Parser cursor, relative to the tail segment's written bytes.
    pub pos: usize,
    pub state: ParseState,
    pub result: ParseResult,

    pub kind: MsgKind,
    /// First decoded key, as a range in chain addressing.
    pub key: Option<(u32, u32)>,
    pub vlen: u32,

    // Fragment group. `frag_id == 0` means not fragmented. The owner is the
    // first fragment; it carries the live `nfrag` and outlives its siblings.
    pub frag_id: u64,
    pub frag_owner: Option<MsgToken>,
    pub nfrag: u32,
    pub first_fragment: bool,
    pub last_fragment: bool,

    // Inline-protocol framing scratch.
    pub narg: u32,
    pub rnarg: u32,
    pub rlen: u32,
    pub integer: u64,

    pub error: bool,
    pub ferror: bool,
    pub done: bool,
    pub fdone: bool,
    pub quit: bool,
    pub noreply: bool,
    pub swallow: bool,
    pub is_read: bool,

    /// Inter-node envelope; owned, released with the message.
    pub dmsg: Option<Dmsg>,
    /// Membership key while in the timeout index.
    pub(crate) tmo_key: Option<TmoKey>,
    /// Entry timestamp for latency stats, microseconds.
    pub stime_us: u64,

    pub(crate) gen: u32,
    pub(crate) in_free: bool,
}

impl Msg {
    pub(crate) fn shell() -> Self {
        Msg {
            id: 0,
            owner: ConnId(0),
            peer: None,
            request: false,
            family: Family::Memcache,
            replication: false,
            chain: MbufChain::new(),
            mlen: 0,
            pos: 0,
            state: ParseState::Start,
            result: ParseResult::Ok,
            kind: MsgKind::Unknown,
            key: None,
            vlen: 0,
            frag_id: 0,
            frag_owner: None,
            nfrag: 0,
            first_fragment: false,
            last_fragment: false,
            narg: 0,
            rnarg: 0,
            rlen: 0,
            integer: 0,
            error: false,
            ferror: false,
            done: false,
            fdone: false,
            quit: false,
            noreply: false,
            swallow: false,
            is_read: true,
            dmsg: None,
            tmo_key: None,
            stime_us: 0,
            gen: 0,
            in_free: false,
        }
    }

    /// Reinitialize a recycled shell. The chain must already be drained.
    pub(crate) fn reset(&mut self, id: u64) {
        debug_assert!(self.chain.is_empty());
        debug_assert!(self.dmsg.is_none());
        debug_assert!(self.tmo_key.is_none());
        self.id = id;
        self.owner = ConnId(0);
        self.peer = None;
        self.request = false;
        self.replication = false;
        self.mlen = 0;
        self.pos = 0;
        self.state = ParseState::Start;
        self.result = ParseResult::Ok;
        self.kind = MsgKind::Unknown;
        self.key = None;
        self.vlen = 0;
        self.frag_id = 0;
        self.frag_owner = None;
        self.nfrag = 0;
        self.first_fragment = false;
        self.last_fragment = false;
        self.narg = 0;
        self.rnarg = 0;
        self.rlen = 0;
        self.integer = 0;
        self.error = false;
        self.ferror = false;
        self.done = false;
        self.fdone = false;
        self.quit = false;
        self.noreply = false;
        self.swallow = false;
        self.is_read = true;
        self.stime_us = 0;
        self.in_free = false;
    }

    /// No payload bytes at all.
    pub fn is_payload_empty(&self) -> bool {
        self.mlen == 0
    }

    /// Copy of the first decoded key.
    pub fn key_bytes(&self) -> Option<Vec<u8>> {
        self.key
            .map(|(a, b)| self.chain.copy_range(a as usize, b as usize))
    }

    /// Recompute the readable byte count from the chain (debug aid; equals
    /// `mlen` on the receive path).
    pub fn recomputed_len(&self) -> usize {
        self.chain.len()
    }
}
