//! Send driver.
//!
//! Drains a connection's outbound queue with bounded scatter-gather: one
//! pass gathers non-empty segment spans across as many queued messages as
//! fit into the iovec cap (and under the platform's signed byte limit),
//! issues a single vectored write, then fans the byte count back across
//! the queue in FIFO order. A partially-sent segment advances its read
//! cursor and stays queued; fully-drained messages complete through
//! `send_done`. Bytes within one message are never reordered, and its
//! segments always occupy a contiguous run of the iovec.

use std::io::{self, IoSlice};

use crate::connection::Connection;
use crate::engine::Engine;
use crate::error::Error;
use crate::message::MsgToken;
use crate::metrics;

struct Span {
    tok: MsgToken,
    seg: usize,
    off: usize,
    len: usize,
}

impl Engine {
    pub fn msg_send(&mut self, conn: &mut dyn Connection) -> Result<(), Error> {
        conn.set_send_ready(true);
        loop {
            let tok = match conn.send_next(self) {
                Some(t) => t,
                None => return Ok(()),
            };
            self.msg_send_chain(conn, tok)?;
            if !conn.send_ready() {
                return Ok(());
            }
        }
    }

    fn msg_send_chain(&mut self, conn: &mut dyn Connection, first: MsgToken) -> Result<(), Error> {
        // writev returns EINVAL if the span total overflows the signed
        // size type or the vector exceeds IOV_MAX.
        let limit = isize::MAX as usize;
        let mut queue: Vec<MsgToken> = Vec::new();
        let mut spans: Vec<Span> = Vec::new();
        let mut nsend = 0usize;

        let mut tok = first;
        'gather: loop {
            queue.push(tok);
            let m = self.msgs.get(tok);
            for (i, seg) in m.chain.iter().enumerate() {
                if seg.is_empty() {
                    continue;
                }
                if spans.len() >= self.iov_cap || nsend >= limit {
                    break 'gather;
                }
                let mut len = seg.len();
                if nsend + len > limit {
                    len = limit - nsend;
                }
                spans.push(Span {
                    tok,
                    seg: i,
                    off: seg.pos,
                    len,
                });
                nsend += len;
            }
            if spans.len() >= self.iov_cap || nsend >= limit {
                break;
            }
            match conn.send_next(self) {
                Some(t) => tok = t,
                None => break,
            }
        }

        conn.set_smsg(None);

        let sent: io::Result<usize> = if nsend > 0 {
            let iovs: Vec<IoSlice<'_>> = spans
                .iter()
                .map(|s| {
                    let seg = self.msgs.get(s.tok).chain.seg(s.seg);
                    IoSlice::new(seg.range(s.off, s.off + s.len))
                })
                .collect();
            match conn.sendv(&iovs, nsend) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e),
            }
        } else {
            Ok(0)
        };

        let mut nsent = match &sent {
            Ok(n) => *n,
            Err(_) => 0,
        };
        metrics::BYTES_SENT.add(nsent as u64);

        // Fan completion out across the gathered queue in FIFO order.
        for tok in queue {
            if nsent == 0 {
                // An empty acknowledgement completes even on a zero-byte
                // write.
                if self.msgs.get(tok).is_payload_empty() {
                    conn.send_done(self, tok);
                }
                continue;
            }
            let mut done = true;
            {
                let m = self.msgs.get_mut(tok);
                for seg in m.chain.iter_mut() {
                    if seg.is_empty() {
                        continue;
                    }
                    let l = seg.len();
                    if nsent < l {
                        seg.pos += nsent;
                        debug_assert!(seg.pos < seg.last);
                        nsent = 0;
                        done = false;
                        break;
                    }
                    seg.mark_empty();
                    nsent -= l;
                }
            }
            if done {
                conn.send_done(self, tok);
            }
        }

        match sent {
            Ok(_) => Ok(()),
            Err(e) => {
                conn.set_err(e.kind());
                Err(e.into())
            }
        }
    }
}
