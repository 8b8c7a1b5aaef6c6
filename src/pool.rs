//! Message pool.
//!
//! Recycles message shells through a LIFO free list (warm-cache reuse) with
//! two allocation ceilings: non-forced acquires fail at the soft ceiling so
//! client traffic degrades first; nothing allocates past the hard ceiling.
//! Acquires on the replication plane are forced — inbound replication is
//! never dropped because client load saturated the pool.

use tracing::{debug, trace};

use crate::buf::MbufPool;
use crate::message::{Msg, MsgToken};
use crate::metrics;

pub struct MsgPool {
    slots: Vec<Msg>,
    free: Vec<u32>,
    allocated: u32,
    soft_limit: u32,
    hard_limit: u32,
    next_id: u64,
    next_frag_id: u64,
}

impl MsgPool {
    pub fn new(soft_limit: u32, hard_limit: u32) -> Self {
        debug_assert!(soft_limit <= hard_limit);
        MsgPool {
            slots: Vec::new(),
            free: Vec::new(),
            allocated: 0,
            soft_limit,
            hard_limit,
            next_id: 0,
            next_frag_id: 0,
        }
    }

    /// Acquire a message shell. Reuses the free-list head when possible;
    /// otherwise allocates, subject to the ceilings: `force` bypasses the
    /// soft ceiling but never the hard one.
    pub fn acquire(&mut self, force: bool) -> Option<MsgToken> {
        self.next_id += 1;
        let id = self.next_id;

        if let Some(idx) = self.free.pop() {
            let msg = &mut self.slots[idx as usize];
            msg.reset(id);
            trace!(id, idx, "reuse msg shell");
            return Some(MsgToken { idx, gen: msg.gen });
        }

        if self.allocated >= self.hard_limit {
            metrics::MESSAGES_DENIED_HARD.increment();
            debug!(allocated = self.allocated, "msg alloc hit hard limit");
            return None;
        }
        if self.allocated >= self.soft_limit && !force {
            metrics::MESSAGES_DENIED_SOFT.increment();
            debug!(allocated = self.allocated, "msg alloc hit soft limit");
            return None;
        }

        self.allocated += 1;
        metrics::MESSAGES_ALLOCATED.increment();

        let idx = self.slots.len() as u32;
        let mut msg = Msg::shell();
        msg.reset(id);
        self.slots.push(msg);
        trace!(id, idx, allocated = self.allocated, "alloc msg shell");
        Some(MsgToken { idx, gen: 0 })
    }

    /// Return a shell to the free-list head. Drains the chain back to the
    /// segment pool, drops the envelope, and unlinks the peer on both
    /// sides. The caller removes any timeout entry first.
    pub fn release(&mut self, tok: MsgToken, bufs: &mut MbufPool) {
        let peer = {
            let msg = &mut self.slots[tok.idx as usize];
            if msg.in_free || msg.gen != tok.gen {
                // Already released, or a stale token.
                return;
            }
            debug_assert!(msg.tmo_key.is_none(), "released while in timeout index");
            trace!(id = msg.id, "put msg shell");
            msg.dmsg = None;
            msg.chain.drain_into(bufs);
            msg.mlen = 0;
            msg.gen = msg.gen.wrapping_add(1);
            msg.in_free = true;
            msg.peer.take()
        };
        if let Some(p) = peer {
            let other = &mut self.slots[p.idx as usize];
            if other.gen == p.gen {
                other.peer = None;
            }
        }
        self.free.push(tok.idx);
    }

    pub fn get(&self, tok: MsgToken) -> &Msg {
        let msg = &self.slots[tok.idx as usize];
        debug_assert_eq!(msg.gen, tok.gen, "stale msg token");
        msg
    }

    pub fn get_mut(&mut self, tok: MsgToken) -> &mut Msg {
        let msg = &mut self.slots[tok.idx as usize];
        debug_assert_eq!(msg.gen, tok.gen, "stale msg token");
        msg
    }

    /// Whether a token still names the message it was issued for.
    pub fn is_live(&self, tok: MsgToken) -> bool {
        self.slots
            .get(tok.idx as usize)
            .map(|m| m.gen == tok.gen && !m.in_free)
            .unwrap_or(false)
    }

    pub fn next_frag_id(&mut self) -> u64 {
        self.next_frag_id += 1;
        self.next_frag_id
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Drop every shell. All messages must have been released.
    pub fn shutdown(&mut self) {
        debug_assert_eq!(
            self.free.len(),
            self.allocated as usize,
            "messages leaked at shutdown"
        );
        self.slots.clear();
        self.free.clear();
        self.allocated = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bufs() -> MbufPool {
        MbufPool::new(64, 0)
    }

    #[test]
    fn ceilings() {
        let mut pool = MsgPool::new(8, 10);
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.acquire(false).expect("below soft limit"));
        }
        assert!(pool.acquire(false).is_none(), "ninth non-forced must fail");
        for _ in 0..2 {
            held.push(pool.acquire(true).expect("forced below hard limit"));
        }
        assert!(pool.acquire(true).is_none(), "hard limit is absolute");
        assert!(pool.acquire(false).is_none());
        assert_eq!(pool.allocated(), 10);
    }

    #[test]
    fn tokens_are_distinct_until_hard_limit() {
        let mut pool = MsgPool::new(4, 4);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let t = pool.acquire(false).unwrap();
            assert!(seen.insert(t));
        }
    }

    #[test]
    fn release_is_lifo_and_chain_drains() {
        let mut bufs = bufs();
        let mut pool = MsgPool::new(4, 4);
        let t = pool.acquire(false).unwrap();
        {
            let m = pool.get_mut(t);
            let mut seg = bufs.get();
            seg.copy_in(b"data");
            m.chain.push(seg);
            m.mlen = 4;
        }
        pool.release(t, &mut bufs);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(bufs.free_len(), 1);

        // LIFO: the same slot comes back, with a fresh generation.
        let t2 = pool.acquire(false).unwrap();
        assert_eq!(t2.idx, t.idx);
        assert_ne!(t2.gen, t.gen);
        assert!(pool.get(t2).chain.is_empty());
        assert!(!pool.is_live(t));
        assert!(pool.is_live(t2));
    }

    #[test]
    fn double_release_is_ignored() {
        let mut bufs = bufs();
        let mut pool = MsgPool::new(4, 4);
        let t = pool.acquire(false).unwrap();
        pool.release(t, &mut bufs);
        pool.release(t, &mut bufs);
        assert_eq!(pool.free_len(), 1, "shell appears exactly once in free list");
    }

    #[test]
    fn release_unlinks_peer_both_ways() {
        let mut bufs = bufs();
        let mut pool = MsgPool::new(4, 4);
        let req = pool.acquire(false).unwrap();
        let rsp = pool.acquire(false).unwrap();
        pool.get_mut(req).peer = Some(rsp);
        pool.get_mut(rsp).peer = Some(req);

        pool.release(req, &mut bufs);
        assert!(pool.get(rsp).peer.is_none());
        pool.release(rsp, &mut bufs);
    }

    #[test]
    fn ids_are_monotonic() {
        let mut bufs = bufs();
        let mut pool = MsgPool::new(4, 4);
        let a = pool.acquire(false).unwrap();
        let ida = pool.get(a).id;
        pool.release(a, &mut bufs);
        let b = pool.acquire(false).unwrap();
        assert!(pool.get(b).id > ida);
    }
}
