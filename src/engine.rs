//! Per-event-loop engine state.
//!
//! One [`Engine`] owns the message pool, segment pool, and timeout index
//! for one event loop. Loops never share engines; multi-core deployments
//! run one engine per loop with no locks anywhere in the message path.

use std::io;
use std::time::Instant;

use tracing::{debug, trace};

use crate::buf::MbufPool;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::Error;
use crate::message::{ConnId, Family, Msg, MsgKind, MsgToken};
use crate::metrics;
use crate::pool::MsgPool;
use crate::timeout::{TimeoutIndex, TmoKey};

/// Where a synthesized error response originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Peer,
    Storage,
}

impl ErrorSource {
    fn tag(&self) -> &'static str {
        match self {
            ErrorSource::Peer => "Peer:",
            ErrorSource::Storage => "Storage:",
        }
    }
}

pub struct Engine {
    pub(crate) bufs: MbufPool,
    pub(crate) msgs: MsgPool,
    pub(crate) tmo: TimeoutIndex,
    pub(crate) iov_cap: usize,
    pub(crate) epoch: Instant,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self, Error> {
        cfg.validate()?;
        let sys_iov = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
        let sys_iov = if sys_iov > 0 { sys_iov as usize } else { 16 };
        let iov_cap = cfg.iov_max.min(sys_iov).min(128);
        debug!(
            mbuf_size = cfg.mbuf_size,
            soft = cfg.msg_soft_limit,
            hard = cfg.msg_hard_limit,
            iov_cap,
            "engine init"
        );
        Ok(Engine {
            bufs: MbufPool::new(cfg.mbuf_size, cfg.mbuf_extra),
            msgs: MsgPool::new(cfg.msg_soft_limit, cfg.msg_hard_limit),
            tmo: TimeoutIndex::new(),
            iov_cap,
            epoch: Instant::now(),
        })
    }

    /// Milliseconds since engine start (the timeout clock).
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Microseconds since engine start (latency stats).
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    // ── Acquisition ─────────────────────────────────────────────────────

    /// Acquire a message bound to `conn`'s family, plane, and role side.
    /// Replication-plane acquires are forced.
    pub fn msg_get(&mut self, conn: &dyn Connection, request: bool) -> Option<MsgToken> {
        self.msg_get_raw(conn.id(), request, conn.family(), conn.replication())
    }

    pub(crate) fn msg_get_raw(
        &mut self,
        owner: ConnId,
        request: bool,
        family: Family,
        replication: bool,
    ) -> Option<MsgToken> {
        let tok = self.msgs.acquire(replication)?;
        let now = self.now_us();
        let msg = self.msgs.get_mut(tok);
        msg.owner = owner;
        msg.request = request;
        msg.family = family;
        msg.replication = replication;
        msg.stime_us = now;
        Some(tok)
    }

    /// Release a message: timeout entry deleted, chain drained, envelope
    /// dropped, peer unlinked, shell recycled.
    pub fn msg_put(&mut self, tok: MsgToken) {
        self.msg_tmo_delete(tok);
        self.msgs.release(tok, &mut self.bufs);
    }

    pub fn msg(&self, tok: MsgToken) -> &Msg {
        self.msgs.get(tok)
    }

    pub fn msg_mut(&mut self, tok: MsgToken) -> &mut Msg {
        self.msgs.get_mut(tok)
    }

    pub fn msg_is_live(&self, tok: MsgToken) -> bool {
        self.msgs.is_live(tok)
    }

    /// Synthesize a one-line error response in the connection's family:
    /// the family's error prefix, a source tag, and the system error text.
    /// Force-acquired so error reporting survives pool pressure.
    pub fn msg_get_error(
        &mut self,
        family: Family,
        source: ErrorSource,
        err: Option<io::Error>,
    ) -> Option<MsgToken> {
        let tok = self.msgs.acquire(true)?;
        let prefix = match family {
            Family::Resp => "-ERR",
            Family::Memcache => "SERVER_ERROR",
        };
        let errstr = err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let line = format!("{} {} {}\r\n", prefix, source.tag(), errstr);

        let mut seg = self.bufs.get();
        let n = line.len().min(seg.writable());
        seg.copy_in(&line.as_bytes()[..n]);

        let msg = self.msgs.get_mut(tok);
        msg.family = family;
        msg.request = false;
        msg.kind = match family {
            Family::Resp => MsgKind::RespError,
            Family::Memcache => MsgKind::McServerError,
        };
        msg.mlen = n as u32;
        msg.chain.push(seg);
        trace!(id = msg.id, len = n, "synthesized error response");
        Some(tok)
    }

    /// Append bytes to a message's chain, growing it segment by segment.
    /// Used by collaborators assembling outbound payloads (envelopes,
    /// synthesized responses).
    pub fn msg_append(&mut self, tok: MsgToken, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            let need_new = self
                .msgs
                .get(tok)
                .chain
                .tail()
                .map(|t| t.writable() == 0)
                .unwrap_or(true);
            if need_new {
                let seg = self.bufs.get();
                self.msgs.get_mut(tok).chain.push(seg);
            }
            let m = self.msgs.get_mut(tok);
            let t = m.chain.tail_mut().expect("tail ensured above");
            let n = t.writable().min(rest.len());
            t.copy_in(&rest[..n]);
            m.mlen += n as u32;
            rest = &rest[n..];
        }
    }

    /// Deep-copy `src`'s chain from segment `from_seg` onward into
    /// `target`, mirroring the identity and decoded fields. Used by the
    /// replication fan-out to duplicate a request per peer.
    pub fn msg_clone(&mut self, src: MsgToken, from_seg: usize, target: MsgToken) {
        let (owner, request, family, replication, noreply, kind, key, vlen, is_read, parts) = {
            let s = self.msgs.get(src);
            let parts: Vec<Vec<u8>> = s
                .chain
                .iter()
                .skip(from_seg)
                .map(|seg| seg.readable().to_vec())
                .collect();
            (
                s.owner,
                s.request,
                s.family,
                s.replication,
                s.noreply,
                s.kind,
                s.key,
                s.vlen,
                s.is_read,
                parts,
            )
        };

        let mut total = 0u32;
        let seg_size = self.bufs.seg_size();
        let mut segs = Vec::new();
        for part in &parts {
            for chunk in part.chunks(seg_size.max(1)) {
                let mut seg = self.bufs.get();
                seg.copy_in(chunk);
                total += chunk.len() as u32;
                segs.push(seg);
            }
        }

        let t = self.msgs.get_mut(target);
        t.owner = owner;
        t.request = request;
        t.family = family;
        t.replication = replication;
        t.noreply = noreply;
        t.kind = kind;
        t.key = key;
        t.vlen = vlen;
        t.is_read = is_read;
        for seg in segs {
            t.chain.push(seg);
        }
        t.mlen = total;
    }

    // ── Timeout index ───────────────────────────────────────────────────

    /// Arm the request timeout for `tok` against `conn`'s deadline.
    /// Non-requests and quit/noreply messages are rejected; a zero or
    /// missing connection timeout skips insertion.
    pub fn msg_tmo_insert(&mut self, tok: MsgToken, conn: &dyn Connection) {
        let key = {
            let msg = self.msgs.get(tok);
            if !msg.request || msg.quit || msg.noreply || msg.tmo_key.is_some() {
                return;
            }
            let timeout_ms = match conn.timeout() {
                Some(t) => t.as_millis() as u64,
                None => return,
            };
            if timeout_ms == 0 {
                return;
            }
            TmoKey {
                deadline_ms: self.now_ms() + timeout_ms,
                msg_id: msg.id,
            }
        };
        self.msgs.get_mut(tok).tmo_key = Some(key);
        self.tmo.insert(key, tok, conn.id());
        metrics::TIMEOUTS_ARMED.increment();
        trace!(
            msg_id = key.msg_id,
            deadline_ms = key.deadline_ms,
            "insert msg into timeout index"
        );
    }

    /// Remove `tok` from the timeout index. Idempotent.
    pub fn msg_tmo_delete(&mut self, tok: MsgToken) {
        if let Some(key) = self.msgs.get_mut(tok).tmo_key.take() {
            self.tmo.remove(key);
            trace!(msg_id = key.msg_id, "delete msg from timeout index");
        }
    }

    /// Message with the earliest deadline, and that deadline.
    pub fn msg_tmo_min(&self) -> Option<(MsgToken, u64)> {
        self.tmo.min().map(|(k, m, _)| (m, k.deadline_ms))
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn msg_free_queue_len(&self) -> usize {
        self.msgs.free_len()
    }

    pub fn msgs_allocated(&self) -> u32 {
        self.msgs.allocated()
    }

    /// Log a message's shape at debug level.
    pub fn msg_dump(&self, tok: MsgToken) {
        let m = self.msgs.get(tok);
        debug!(
            id = m.id,
            request = m.request,
            mlen = m.mlen,
            kind = ?m.kind,
            done = m.done,
            error = m.error,
            nsegs = m.chain.nsegs(),
            "msg dump"
        );
        for (i, seg) in m.chain.iter().enumerate() {
            let preview = seg.readable().iter().take(32).copied().collect::<Vec<_>>();
            trace!(
                seg = i,
                pos = seg.pos,
                last = seg.last,
                data = %String::from_utf8_lossy(&preview).escape_debug(),
                "segment"
            );
        }
    }

    /// Tear the engine down. Every message must have been released.
    pub fn shutdown(mut self) {
        self.msgs.shutdown();
    }
}
