//! Receive driver.
//!
//! One pass per readiness edge: append bytes to the current inbound
//! message's tail segment (sized down to the announced envelope payload
//! when it is sealed), decrypt completed ciphertext chunks in place, then
//! run the parser driver over every frame that arrived in the read. The
//! outer loop drains the connection while its readiness flag holds.

use std::io;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::crypto;
use crate::engine::Engine;
use crate::envelope::FLAG_SEALED;
use crate::error::Error;
use crate::message::MsgToken;
use crate::metrics;

impl Engine {
    pub fn msg_recv(&mut self, conn: &mut dyn Connection) -> Result<(), Error> {
        conn.set_recv_ready(true);
        loop {
            let tok = match conn.recv_next(self, true) {
                Some(t) => t,
                None => return Ok(()),
            };
            self.msg_recv_chain(conn, tok)?;
            if !conn.recv_ready() {
                return Ok(());
            }
        }
    }

    fn msg_recv_chain(&mut self, conn: &mut dyn Connection, tok: MsgToken) -> Result<(), Error> {
        // Sizing policy: a sealed envelope payload is read at most `plen`
        // bytes at a time, clamped so the ciphertext chunk (overhead
        // included) lands within one segment's extra-capacity region.
        let sealed = {
            let m = self.msgs.get(tok);
            m.dmsg.as_ref().filter(|d| d.sealed()).map(|d| d.plen)
        };
        if self.envelope_oversized(tok) {
            warn!("sealed envelope payload exceeds segment capacity");
            return self.parse_failed(conn, tok);
        }

        {
            let Engine { msgs, bufs, .. } = self;
            let m = msgs.get_mut(tok);
            let need_new = match m.chain.tail() {
                None => true,
                Some(t) => t.is_full() || (sealed.is_some() && t.writable_extra() == 0),
            };
            if need_new {
                m.chain.push(bufs.get());
                m.pos = 0;
            } else if let Some(t) = m.chain.tail_mut() {
                t.take_read_flip();
            }
        }

        let n = {
            let m = self.msgs.get_mut(tok);
            let t = m.chain.tail_mut().expect("tail ensured above");
            let include_extra = sealed.is_some();
            let limit = match sealed {
                Some(plen) => plen.min(t.writable_extra()),
                None => t.writable(),
            };
            let n = if limit == 0 {
                0
            } else {
                match conn.recv(t.unwritten_mut(include_extra, limit)) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => {
                        conn.set_err(e.kind());
                        return Err(e.into());
                    }
                }
            };
            t.advance_write(n);
            m.mlen += n as u32;
            n
        };
        metrics::BYTES_RECEIVED.add(n as u64);

        if sealed.is_some() && n > 0 {
            {
                let m = self.msgs.get_mut(tok);
                if let Some(d) = &mut m.dmsg {
                    d.plen = d.plen.saturating_sub(n);
                }
            }
            self.try_decrypt(conn, tok)?;
        }

        // Parse every frame this read completed; the connection feeds the
        // successor message back through `recv_next` after each hand-off.
        let mut cur = tok;
        loop {
            self.msg_parse(conn, cur)?;
            match conn.recv_next(self, false) {
                None => break,
                Some(t) if t == cur => break,
                Some(t) => cur = t,
            }
        }
        Ok(())
    }

    /// Whether a sealed envelope announces a payload too large to land in
    /// one segment (extra region included).
    pub(crate) fn envelope_oversized(&self, tok: MsgToken) -> bool {
        let max = self
            .bufs
            .seg_capacity_extra()
            .min(self.bufs.seg_size() + crypto::OVERHEAD);
        self.msgs
            .get(tok)
            .dmsg
            .as_ref()
            .map(|d| d.sealed() && d.psize > max)
            .unwrap_or(false)
    }

    /// Decrypt the tail segment once a sealed envelope chunk is fully
    /// present: plaintext (plus any spillover bytes from the next frame)
    /// replaces the ciphertext segment, which returns to the pool. Returns
    /// whether a decryption happened, so the caller can re-run the parser.
    pub(crate) fn try_decrypt(
        &mut self,
        conn: &dyn Connection,
        tok: MsgToken,
    ) -> Result<bool, Error> {
        let psize = {
            let m = self.msgs.get(tok);
            match &m.dmsg {
                Some(d) if d.sealed() && d.plen == 0 => d.psize,
                _ => return Ok(false),
            }
        };
        {
            let m = self.msgs.get(tok);
            match m.chain.tail() {
                Some(t) if t.last >= psize => {}
                _ => return Ok(false),
            }
        }

        let key = conn.aes_key().ok_or(Error::Crypto)?;
        let (plain, spill) = {
            let m = self.msgs.get(tok);
            let t = m.chain.tail().expect("tail checked above");
            let plain = crypto::open(t.range(0, psize), key)?;
            (plain, t.range(psize, t.last).to_vec())
        };

        let mut nseg = self.bufs.get();
        nseg.copy_in(&plain);
        nseg.copy_in(&spill);
        nseg.read_flip = true;
        let nlen = nseg.len() as u32;

        let old = {
            let m = self.msgs.get_mut(tok);
            let old = m.chain.pop_tail().expect("tail checked above");
            m.mlen -= old.len() as u32;
            m.mlen += nlen;
            m.chain.push(nseg);
            m.pos = 0;
            if let Some(d) = &mut m.dmsg {
                d.bit_field &= !FLAG_SEALED;
            }
            old
        };
        self.bufs.put(old);
        debug!(
            msg = self.msgs.get(tok).id,
            psize,
            plain = nlen,
            "decrypted envelope payload"
        );
        Ok(true)
    }
}
