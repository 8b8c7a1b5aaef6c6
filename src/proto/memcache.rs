//! Text-line family adapter (memcache ASCII).
//!
//! Requests are single CRLF-terminated command lines, with storage commands
//! carrying a byte-counted value body. Multi-key retrievals fragment: the
//! parser stops before each remaining key and the split hooks re-emit a
//! valid single-key command at the head of every sibling.

use super::{
    consume_body, parse_dec, scan_line, split_tokens, BodyScan, LineScan, Protocol,
};
use crate::buf::{Mbuf, MbufPool};
use crate::error::Error;
use crate::message::{Msg, MsgKind, ParseResult, ParseState};

pub struct Memcache;

impl Protocol for Memcache {
    fn parse_req(&self, msg: &mut Msg) -> ParseResult {
        parse_req(msg)
    }

    fn parse_rsp(&self, msg: &mut Msg) -> ParseResult {
        parse_rsp(msg)
    }

    fn pre_splitcopy(&self, msg: &Msg, seg: &mut Mbuf) {
        debug_assert!(msg.kind.fragments());
        match msg.kind {
            MsgKind::McGets => seg.copy_in(b"gets "),
            _ => seg.copy_in(b"get "),
        }
    }

    fn post_splitcopy(&self, msg: &mut Msg, bufs: &mut MbufPool) -> Result<(), Error> {
        // The truncated original lost its line terminator to the split.
        let fits = msg.chain.tail().map(|t| t.writable() >= 2).unwrap_or(false);
        if fits {
            msg.chain.tail_mut().expect("tail exists").copy_in(b"\r\n");
        } else {
            let mut seg = bufs.get();
            seg.copy_in(b"\r\n");
            msg.chain.push(seg);
        }
        msg.mlen += 2;
        msg.pos = msg.chain.tail().expect("tail exists").last;
        Ok(())
    }

    fn pre_coalesce(&self, rsp: &mut Msg, last_fragment: bool) {
        if last_fragment {
            return;
        }
        if !matches!(rsp.kind, MsgKind::McValue | MsgKind::McEnd) {
            return;
        }
        let Some(tail) = rsp.chain.tail_mut() else {
            return;
        };
        if tail.len() >= 5 && tail.range(tail.last - 5, tail.last) == b"END\r\n" {
            tail.last -= 5;
            rsp.mlen -= 5;
        }
    }

    fn post_coalesce(&self, _rsp: &mut Msg, _nfrag: u32, _bufs: &mut MbufPool) {
        // The last fragment's END terminates the combined reply.
    }
}

fn parse_req(msg: &mut Msg) -> ParseResult {
    if let ParseState::ValueBody { remaining } = msg.state {
        return finish_body(msg, remaining);
    }

    let base = msg.chain.tail_base();
    let tail = match msg.chain.tail() {
        Some(t) => t,
        None => return ParseResult::Again,
    };
    let buf = tail.written();
    let line_end = match scan_line(buf, msg.pos, tail.is_full()) {
        LineScan::Again => return ParseResult::Again,
        LineScan::Repair => return ParseResult::Repair,
        LineScan::Line { end } => end,
    };
    let toks = split_tokens(buf, msg.pos, line_end);
    if toks.is_empty() {
        return ParseResult::Error;
    }
    let tok = |i: usize| &buf[toks[i].0..toks[i].1];
    let abs = |span: (usize, usize)| ((base + span.0) as u32, (base + span.1) as u32);

    match tok(0) {
        b"get" | b"gets" => {
            let keys = &toks[1..];
            if keys.is_empty() {
                return ParseResult::Error;
            }
            msg.kind = if tok(0) == b"gets" {
                MsgKind::McGets
            } else {
                MsgKind::McGet
            };
            msg.is_read = true;
            msg.key = Some(abs(keys[0]));
            msg.narg = keys.len() as u32;
            if keys.len() > 1 {
                // Stop before the second key; the driver splits here.
                msg.pos = keys[1].0;
                return ParseResult::Fragment;
            }
            msg.pos = line_end + 2;
            ParseResult::Ok
        }
        b"set" | b"add" | b"replace" => {
            if toks.len() < 5 || toks.len() > 6 {
                return ParseResult::Error;
            }
            msg.kind = match tok(0) {
                b"add" => MsgKind::McAdd,
                b"replace" => MsgKind::McReplace,
                _ => MsgKind::McSet,
            };
            msg.is_read = false;
            msg.key = Some(abs(toks[1]));
            if parse_dec(tok(2)).is_none() || parse_dec(tok(3)).is_none() {
                return ParseResult::Error;
            }
            let vlen = match parse_dec(tok(4)) {
                Some(v) => v as usize,
                None => return ParseResult::Error,
            };
            if toks.len() == 6 {
                if tok(5) != b"noreply" {
                    return ParseResult::Error;
                }
                msg.noreply = true;
            }
            msg.vlen = vlen as u32;
            msg.pos = line_end + 2;
            finish_body(msg, vlen + 2)
        }
        b"delete" => {
            if toks.len() < 2 || toks.len() > 3 {
                return ParseResult::Error;
            }
            msg.kind = MsgKind::McDelete;
            msg.is_read = false;
            msg.key = Some(abs(toks[1]));
            if toks.len() == 3 {
                if tok(2) != b"noreply" {
                    return ParseResult::Error;
                }
                msg.noreply = true;
            }
            msg.pos = line_end + 2;
            ParseResult::Ok
        }
        b"quit" => {
            if toks.len() != 1 {
                return ParseResult::Error;
            }
            msg.kind = MsgKind::McQuit;
            msg.quit = true;
            msg.pos = line_end + 2;
            ParseResult::Ok
        }
        _ => ParseResult::Error,
    }
}

fn finish_body(msg: &mut Msg, remaining: usize) -> ParseResult {
    match consume_body(msg, remaining) {
        BodyScan::Done => {
            msg.state = ParseState::Start;
            ParseResult::Ok
        }
        BodyScan::Again { remaining } => {
            msg.state = ParseState::ValueBody { remaining };
            ParseResult::Again
        }
        BodyScan::Error => ParseResult::Error,
    }
}

fn parse_rsp(msg: &mut Msg) -> ParseResult {
    loop {
        if let ParseState::ValueBody { remaining } = msg.state {
            match consume_body(msg, remaining) {
                BodyScan::Done => {
                    msg.state = ParseState::Start;
                    // Fall through to the next line (VALUE or END).
                }
                BodyScan::Again { remaining } => {
                    msg.state = ParseState::ValueBody { remaining };
                    return ParseResult::Again;
                }
                BodyScan::Error => return ParseResult::Error,
            }
        }

        let tail = match msg.chain.tail() {
            Some(t) => t,
            None => return ParseResult::Again,
        };
        let buf = tail.written();
        let line_end = match scan_line(buf, msg.pos, tail.is_full()) {
            LineScan::Again => return ParseResult::Again,
            LineScan::Repair => return ParseResult::Repair,
            LineScan::Line { end } => end,
        };
        let toks = split_tokens(buf, msg.pos, line_end);
        if toks.is_empty() {
            return ParseResult::Error;
        }
        let first = &buf[toks[0].0..toks[0].1];

        match first {
            b"VALUE" => {
                if toks.len() < 4 || toks.len() > 5 {
                    return ParseResult::Error;
                }
                let vlen = match parse_dec(&buf[toks[3].0..toks[3].1]) {
                    Some(v) => v as usize,
                    None => return ParseResult::Error,
                };
                msg.kind = MsgKind::McValue;
                msg.vlen = vlen as u32;
                msg.pos = line_end + 2;
                msg.state = ParseState::ValueBody {
                    remaining: vlen + 2,
                };
            }
            b"END" => {
                if msg.kind == MsgKind::Unknown {
                    msg.kind = MsgKind::McEnd;
                }
                msg.pos = line_end + 2;
                return ParseResult::Ok;
            }
            b"STORED" | b"NOT_STORED" | b"DELETED" | b"NOT_FOUND" => {
                msg.kind = match first {
                    b"STORED" => MsgKind::McStored,
                    b"NOT_STORED" => MsgKind::McNotStored,
                    b"DELETED" => MsgKind::McDeleted,
                    _ => MsgKind::McNotFound,
                };
                msg.pos = line_end + 2;
                return ParseResult::Ok;
            }
            b"ERROR" | b"CLIENT_ERROR" | b"SERVER_ERROR" => {
                msg.kind = match first {
                    b"ERROR" => MsgKind::McError,
                    b"CLIENT_ERROR" => MsgKind::McClientError,
                    _ => MsgKind::McServerError,
                };
                msg.pos = line_end + 2;
                return ParseResult::Ok;
            }
            _ => return ParseResult::Error,
        }
    }
}
