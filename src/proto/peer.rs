//! Replication-plane parser.
//!
//! Frames between peer nodes arrive wrapped in the inter-node envelope:
//! a preamble line, then the payload. A sealed payload must first be
//! isolated at a segment start (the preamble triggers a repair split) and
//! decrypted by the receive driver; the parser idles on AGAIN until the
//! driver clears the sealed flag, then hands the plaintext to the family
//! parser. Plaintext payloads delegate immediately.

use super::{scan_line, LineScan};
use crate::envelope::Dmsg;
use crate::message::{Msg, ParseResult, ParseState};

pub(crate) fn parse(msg: &mut Msg) -> ParseResult {
    if msg.dmsg.is_none() {
        let tail = match msg.chain.tail() {
            Some(t) => t,
            None => return ParseResult::Again,
        };
        let buf = tail.written();
        if msg.pos >= buf.len() {
            return ParseResult::Again;
        }
        let end = match scan_line(buf, msg.pos, tail.is_full()) {
            LineScan::Again => return ParseResult::Again,
            LineScan::Repair => return ParseResult::Repair,
            LineScan::Line { end } => end,
        };
        let mut dmsg = match Dmsg::decode(&buf[msg.pos..end]) {
            Some(d) => d,
            None => return ParseResult::Error,
        };
        let payload_pos = end + 2;
        if dmsg.sealed() {
            // Payload bytes that rode in with the preamble count against
            // what is still owed on the wire.
            let avail = buf.len() - payload_pos;
            dmsg.plen = dmsg.psize.saturating_sub(avail);
            msg.pos = payload_pos;
            msg.dmsg = Some(dmsg);
            msg.state = ParseState::Envelope;
            // Force the sealed bytes to a segment start so decryption can
            // operate on `[0, psize)`.
            return ParseResult::Repair;
        }
        msg.pos = payload_pos;
        msg.dmsg = Some(dmsg);
        msg.state = ParseState::Envelope;
    }

    if msg.dmsg.as_ref().map(|d| d.sealed()).unwrap_or(false) {
        // Waiting for the receive driver to finish reading and decrypting.
        return ParseResult::Again;
    }

    let proto = super::for_family(msg.family);
    if msg.request {
        proto.parse_req(msg)
    } else {
        proto.parse_rsp(msg)
    }
}
