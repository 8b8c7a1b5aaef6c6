//! Parser driver.
//!
//! Repeatedly invokes the bound parser over a message's chain and acts on
//! the outcome: complete frames hand off through `recv_done` (splitting
//! pipelined trailing bytes into a successor message), FRAGMENT splits a
//! multi-key request into a sibling sharing the fragment group, REPAIR
//! re-lands unparsed bytes contiguously, AGAIN waits for more data, and
//! parse errors fail client connections but never tear down replication
//! transports.

use std::io;

use tracing::debug;

use crate::connection::Connection;
use crate::engine::Engine;
use crate::error::Error;
use crate::message::{MsgToken, ParseResult};
use crate::metrics;
use crate::proto;

impl Engine {
    pub(crate) fn msg_parse(
        &mut self,
        conn: &mut dyn Connection,
        tok: MsgToken,
    ) -> Result<(), Error> {
        if self.msgs.get(tok).is_payload_empty() {
            // Nothing to parse (EOF handshake path).
            conn.recv_done(self, tok, None);
            return Ok(());
        }
        loop {
            let result = {
                let msg = self.msgs.get_mut(tok);
                let r = if msg.replication {
                    proto::peer::parse(msg)
                } else {
                    let p = proto::for_family(msg.family);
                    if msg.request {
                        p.parse_req(msg)
                    } else {
                        p.parse_rsp(msg)
                    }
                };
                msg.result = r;
                r
            };
            match result {
                ParseResult::Ok => return self.msg_parsed(conn, tok),
                ParseResult::Fragment => return self.msg_fragment(conn, tok),
                ParseResult::Again => return Ok(()),
                ParseResult::Repair => {
                    let (at, tail_pos) = {
                        let m = self.msgs.get(tok);
                        (m.pos, m.chain.tail().map(|t| t.pos).unwrap_or(0))
                    };
                    if at == tail_pos {
                        // The straddling token fills an entire segment;
                        // splitting cannot restore contiguity.
                        return self.parse_failed(conn, tok);
                    }
                    self.msg_repair(tok);
                    if self.envelope_oversized(tok) {
                        return self.parse_failed(conn, tok);
                    }
                    if self.try_decrypt(conn, tok)? {
                        continue;
                    }
                    return Ok(());
                }
                ParseResult::Error => return self.parse_failed(conn, tok),
            }
        }
    }

    /// A whole frame parsed. Trailing unparsed bytes seed the next message.
    fn msg_parsed(&mut self, conn: &mut dyn Connection, tok: MsgToken) -> Result<(), Error> {
        let (complete, at, owner, request, family, replication) = {
            let m = self.msgs.get(tok);
            let t = m.chain.tail().expect("parsed message has a tail");
            (m.pos == t.last, m.pos, m.owner, m.request, m.family, m.replication)
        };
        if complete {
            conn.recv_done(self, tok, None);
            return Ok(());
        }

        let nbuf = {
            let Engine { msgs, bufs, .. } = self;
            msgs.get_mut(tok).chain.split(bufs, at)
        };
        let npos = nbuf.pos;
        let nlen = nbuf.len() as u32;
        let ntok = match self.msg_get_raw(owner, request, family, replication) {
            Some(t) => t,
            None => {
                self.bufs.put(nbuf);
                return Err(Error::PoolExhausted);
            }
        };
        {
            let n = self.msgs.get_mut(ntok);
            n.pos = npos;
            n.mlen = nlen;
            n.chain.push(nbuf);
        }
        self.msgs.get_mut(tok).mlen -= nlen;

        conn.recv_done(self, tok, Some(ntok));
        Ok(())
    }

    /// Split a multi-key request at the parser cursor into a sibling
    /// message sharing the fragment group.
    fn msg_fragment(&mut self, conn: &mut dyn Connection, tok: MsgToken) -> Result<(), Error> {
        let (at, owner, request, family, replication) = {
            let m = self.msgs.get(tok);
            debug_assert!(m.request);
            (m.pos, m.owner, m.request, m.family, m.replication)
        };
        let p = proto::for_family(family);

        // Carve the remainder behind a protocol-correct command preamble.
        let mut nbuf = self.bufs.get();
        p.pre_splitcopy(self.msgs.get(tok), &mut nbuf);
        let lost = {
            let m = self.msgs.get_mut(tok);
            let before = m.chain.tail().expect("fragmenting message has a tail").last;
            m.chain.split_into(at, &mut nbuf);
            (before - at) as u32
        };
        self.msgs.get_mut(tok).mlen -= lost;

        {
            let Engine { msgs, bufs, .. } = self;
            if let Err(e) = p.post_splitcopy(msgs.get_mut(tok), bufs) {
                bufs.put(nbuf);
                return Err(e);
            }
        }

        let ntok = match self.msg_get_raw(owner, request, family, replication) {
            Some(t) => t,
            None => {
                self.bufs.put(nbuf);
                return Err(Error::PoolExhausted);
            }
        };
        let npos = nbuf.pos;
        let nlen = nbuf.len() as u32;
        {
            let n = self.msgs.get_mut(ntok);
            n.pos = npos;
            n.mlen = nlen;
            n.chain.push(nbuf);
        }

        // Group assignment: the first split makes the original the group
        // owner; every sibling back-references it. Exactly one fragment
        // carries each of the first/last markers.
        let newid = if self.msgs.get(tok).frag_id == 0 {
            self.msgs.next_frag_id()
        } else {
            0
        };
        let (fid, owner_tok) = {
            let m = self.msgs.get_mut(tok);
            if m.frag_id == 0 {
                m.frag_id = newid;
                m.first_fragment = true;
                m.nfrag = 1;
                m.frag_owner = Some(tok);
            }
            m.last_fragment = false;
            (m.frag_id, m.frag_owner.expect("fragment group has an owner"))
        };
        {
            let s = self.msgs.get_mut(ntok);
            s.frag_id = fid;
            s.frag_owner = Some(owner_tok);
            s.last_fragment = true;
        }
        self.msgs.get_mut(owner_tok).nfrag += 1;

        metrics::FRAGMENTS.increment();
        debug!(
            frag_id = fid,
            msg = self.msgs.get(tok).id,
            sibling = self.msgs.get(ntok).id,
            "fragmented request"
        );

        conn.recv_done(self, tok, Some(ntok));
        Ok(())
    }

    /// Re-insert the unparsed tail so the next read lands contiguously
    /// with it.
    fn msg_repair(&mut self, tok: MsgToken) {
        let at = self.msgs.get(tok).pos;
        let nbuf = {
            let Engine { msgs, bufs, .. } = self;
            msgs.get_mut(tok).chain.split(bufs, at)
        };
        let npos = nbuf.pos;
        let m = self.msgs.get_mut(tok);
        m.chain.push(nbuf);
        m.pos = npos;
    }

    pub(crate) fn parse_failed(
        &mut self,
        conn: &mut dyn Connection,
        tok: MsgToken,
    ) -> Result<(), Error> {
        let owner = {
            let m = self.msgs.get_mut(tok);
            m.error = true;
            m.result = ParseResult::Error;
            if m.frag_id > 0 {
                m.frag_owner
            } else {
                None
            }
        };
        if let Some(o) = owner {
            if self.msgs.is_live(o) {
                self.msgs.get_mut(o).ferror = true;
            }
        }
        if conn.replication() {
            // The transport stays up; the frame is swallowed.
            metrics::PARSE_ERRORS_PEER.increment();
            debug!(conn = conn.id().0, "swallowing malformed replication frame");
            self.msgs.get_mut(tok).swallow = true;
            return Ok(());
        }
        metrics::PARSE_ERRORS_CLIENT.increment();
        conn.set_err(io::ErrorKind::InvalidData);
        Err(Error::Protocol)
    }
}
