//! Length-prefixed inline family adapter (RESP).
//!
//! Every request is an array of bulk strings: `*<n>\r\n` then `n` elements
//! of `$<len>\r\n<bytes>\r\n`. The parser keeps the array arithmetic in the
//! message's framing fields (`narg`, `rnarg`, `rlen`) and streams large
//! bulk bodies through the value-body state. Multi-key commands fragment
//! before each remaining key; the split hooks re-emit a shrunken array
//! header for both sides.

use super::{consume_body, parse_dec, scan_line, BodyScan, LineScan, Protocol};
use crate::buf::{Mbuf, MbufPool};
use crate::error::Error;
use crate::message::{Msg, MsgKind, ParseResult, ParseState};

pub struct Resp;

impl Protocol for Resp {
    fn parse_req(&self, msg: &mut Msg) -> ParseResult {
        parse_req(msg)
    }

    fn parse_rsp(&self, msg: &mut Msg) -> ParseResult {
        parse_rsp(msg)
    }

    fn pre_splitcopy(&self, msg: &Msg, seg: &mut Mbuf) {
        debug_assert!(msg.kind.fragments());
        let cmd: &[u8] = match msg.kind {
            MsgKind::RespDel => b"del",
            _ => b"mget",
        };
        // The sibling carries the command plus every remaining key.
        let header = format!("*{}\r\n${}\r\n", msg.rnarg + 1, cmd.len());
        seg.copy_in(header.as_bytes());
        seg.copy_in(cmd);
        seg.copy_in(b"\r\n");
    }

    fn post_splitcopy(&self, msg: &mut Msg, _bufs: &mut MbufPool) -> Result<(), Error> {
        // The retained frame is now command + first key: rewrite its element
        // count to 2, right-aligned over the original digits so no bytes
        // shift. The head read cursor skips any leftover digit.
        let old_digits = decimal_len(msg.narg);
        let head = match msg.chain.head_mut() {
            Some(h) => h,
            None => return Ok(()),
        };
        let base = head.pos;
        head.patch(base + old_digits - 1, b"*2");
        head.pos += old_digits - 1;
        msg.mlen -= (old_digits - 1) as u32;
        msg.narg = 2;
        msg.rnarg = 0;
        Ok(())
    }

    fn pre_coalesce(&self, rsp: &mut Msg, _last_fragment: bool) {
        match rsp.kind {
            MsgKind::RespMultibulk => {
                // Drop this fragment's own array header; the combined header
                // is emitted once by post_coalesce.
                let hdr_len = 1 + decimal_len(rsp.narg) + 2;
                if let Some(head) = rsp.chain.head_mut() {
                    head.pos += hdr_len;
                }
                rsp.mlen -= hdr_len as u32;
            }
            MsgKind::RespInteger => {
                // Count-style replies merge by summing `integer`; the bytes
                // themselves are discarded.
                for seg in rsp.chain.iter_mut() {
                    seg.mark_empty();
                }
                rsp.mlen = 0;
            }
            _ => {}
        }
    }

    fn post_coalesce(&self, rsp: &mut Msg, nfrag: u32, bufs: &mut MbufPool) {
        match rsp.kind {
            MsgKind::RespMultibulk => {
                let mut seg = bufs.get();
                seg.copy_in(format!("*{}\r\n", nfrag).as_bytes());
                rsp.mlen += seg.len() as u32;
                rsp.chain.push_front(seg);
            }
            MsgKind::RespInteger => {
                let mut seg = bufs.get();
                seg.copy_in(format!(":{}\r\n", rsp.integer).as_bytes());
                rsp.mlen += seg.len() as u32;
                rsp.chain.push_front(seg);
            }
            _ => {}
        }
    }
}

fn decimal_len(mut n: u32) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

/// Outcome of reading one `$<len>\r\n<bytes>\r\n` element that must sit
/// contiguously in the tail (command names and keys).
enum BulkScan {
    Done { body: (usize, usize), next: usize },
    Again,
    Repair,
    Error,
}

fn read_bulk(buf: &[u8], pos: usize, full: bool) -> BulkScan {
    if pos >= buf.len() {
        return BulkScan::Again;
    }
    if buf[pos] != b'$' {
        return BulkScan::Error;
    }
    let end = match scan_line(buf, pos, full) {
        LineScan::Again => return BulkScan::Again,
        LineScan::Repair => return BulkScan::Repair,
        LineScan::Line { end } => end,
    };
    let n = match parse_dec(&buf[pos + 1..end]) {
        Some(n) => n as usize,
        None => return BulkScan::Error,
    };
    let body_start = end + 2;
    let body_end = body_start + n;
    if body_end + 2 > buf.len() {
        return if full { BulkScan::Repair } else { BulkScan::Again };
    }
    if &buf[body_end..body_end + 2] != b"\r\n" {
        return BulkScan::Error;
    }
    BulkScan::Done {
        body: (body_start, body_end),
        next: body_end + 2,
    }
}

fn parse_req(msg: &mut Msg) -> ParseResult {
    loop {
        if let ParseState::ValueBody { remaining } = msg.state {
            match consume_body(msg, remaining) {
                BodyScan::Done => {
                    msg.state = ParseState::Start;
                    if msg.rnarg == 0 {
                        return ParseResult::Ok;
                    }
                }
                BodyScan::Again { remaining } => {
                    msg.state = ParseState::ValueBody { remaining };
                    return ParseResult::Again;
                }
                BodyScan::Error => return ParseResult::Error,
            }
            continue;
        }

        let base = msg.chain.tail_base();
        let tail = match msg.chain.tail() {
            Some(t) => t,
            None => return ParseResult::Again,
        };
        let buf = tail.written();
        let full = tail.is_full();

        if msg.narg == 0 {
            if msg.pos >= buf.len() {
                return ParseResult::Again;
            }
            if buf[msg.pos] != b'*' {
                return ParseResult::Error;
            }
            let end = match scan_line(buf, msg.pos, full) {
                LineScan::Again => return ParseResult::Again,
                LineScan::Repair => return ParseResult::Repair,
                LineScan::Line { end } => end,
            };
            let n = match parse_dec(&buf[msg.pos + 1..end]) {
                Some(n) if n >= 1 => n as u32,
                _ => return ParseResult::Error,
            };
            msg.narg = n;
            msg.rnarg = n;
            msg.pos = end + 2;
            continue;
        }

        if msg.kind == MsgKind::Unknown {
            // First element: the command name.
            match read_bulk(buf, msg.pos, full) {
                BulkScan::Again => return ParseResult::Again,
                BulkScan::Repair => return ParseResult::Repair,
                BulkScan::Error => return ParseResult::Error,
                BulkScan::Done { body, next } => {
                    let cmd = &buf[body.0..body.1];
                    let kind = if cmd.eq_ignore_ascii_case(b"get") {
                        MsgKind::RespGet
                    } else if cmd.eq_ignore_ascii_case(b"mget") {
                        MsgKind::RespMget
                    } else if cmd.eq_ignore_ascii_case(b"set") {
                        MsgKind::RespSet
                    } else if cmd.eq_ignore_ascii_case(b"del") {
                        MsgKind::RespDel
                    } else if cmd.eq_ignore_ascii_case(b"quit") {
                        MsgKind::RespQuit
                    } else {
                        return ParseResult::Error;
                    };
                    let arity_ok = match kind {
                        MsgKind::RespGet => msg.narg == 2,
                        MsgKind::RespMget | MsgKind::RespDel => msg.narg >= 2,
                        MsgKind::RespSet => msg.narg >= 3,
                        MsgKind::RespQuit => msg.narg == 1,
                        _ => false,
                    };
                    if !arity_ok {
                        return ParseResult::Error;
                    }
                    msg.kind = kind;
                    msg.is_read = kind.is_read();
                    msg.rnarg -= 1;
                    msg.pos = next;
                    if kind == MsgKind::RespQuit {
                        msg.quit = true;
                        return ParseResult::Ok;
                    }
                    continue;
                }
            }
        }

        if msg.key.is_none() {
            match read_bulk(buf, msg.pos, full) {
                BulkScan::Again => return ParseResult::Again,
                BulkScan::Repair => return ParseResult::Repair,
                BulkScan::Error => return ParseResult::Error,
                BulkScan::Done { body, next } => {
                    msg.key = Some(((base + body.0) as u32, (base + body.1) as u32));
                    msg.rnarg -= 1;
                    msg.pos = next;
                    if msg.kind.fragments() && msg.rnarg > 0 {
                        // Stop before the next key; the driver splits here.
                        return ParseResult::Fragment;
                    }
                    if msg.rnarg == 0 {
                        return ParseResult::Ok;
                    }
                    continue;
                }
            }
        }

        // Remaining elements (a SET value, trailing options): header here,
        // body streamed through the value-body state.
        if msg.pos >= buf.len() {
            return ParseResult::Again;
        }
        if buf[msg.pos] != b'$' {
            return ParseResult::Error;
        }
        let end = match scan_line(buf, msg.pos, full) {
            LineScan::Again => return ParseResult::Again,
            LineScan::Repair => return ParseResult::Repair,
            LineScan::Line { end } => end,
        };
        let n = match parse_dec(&buf[msg.pos + 1..end]) {
            Some(n) => n as usize,
            None => return ParseResult::Error,
        };
        if msg.kind == MsgKind::RespSet && msg.rnarg == msg.narg - 2 {
            // The element right after the key is the value.
            msg.vlen = n as u32;
        }
        msg.rlen = n as u32;
        msg.rnarg -= 1;
        msg.pos = end + 2;
        msg.state = ParseState::ValueBody { remaining: n + 2 };
    }
}

fn parse_rsp(msg: &mut Msg) -> ParseResult {
    loop {
        if let ParseState::ValueBody { remaining } = msg.state {
            match consume_body(msg, remaining) {
                BodyScan::Done => {
                    msg.state = ParseState::Start;
                    if msg.rnarg == 0 {
                        return ParseResult::Ok;
                    }
                }
                BodyScan::Again { remaining } => {
                    msg.state = ParseState::ValueBody { remaining };
                    return ParseResult::Again;
                }
                BodyScan::Error => return ParseResult::Error,
            }
            continue;
        }

        let tail = match msg.chain.tail() {
            Some(t) => t,
            None => return ParseResult::Again,
        };
        let buf = tail.written();
        let full = tail.is_full();
        if msg.pos >= buf.len() {
            return ParseResult::Again;
        }

        if !matches!(buf[msg.pos], b'+' | b'-' | b':' | b'$' | b'*') {
            return ParseResult::Error;
        }
        let end = match scan_line(buf, msg.pos, full) {
            LineScan::Again => return ParseResult::Again,
            LineScan::Repair => return ParseResult::Repair,
            LineScan::Line { end } => end,
        };
        let line = &buf[msg.pos + 1..end];
        let in_multibulk = msg.kind == MsgKind::RespMultibulk && msg.rnarg > 0;

        match buf[msg.pos] {
            b'+' | b'-' => {
                if !in_multibulk {
                    msg.kind = if buf[msg.pos] == b'+' {
                        MsgKind::RespStatus
                    } else {
                        MsgKind::RespError
                    };
                }
                msg.pos = end + 2;
                if in_multibulk {
                    msg.rnarg -= 1;
                    if msg.rnarg == 0 {
                        return ParseResult::Ok;
                    }
                    continue;
                }
                return ParseResult::Ok;
            }
            b':' => {
                let v = match parse_int(line) {
                    Some(v) => v,
                    None => return ParseResult::Error,
                };
                msg.pos = end + 2;
                if in_multibulk {
                    msg.rnarg -= 1;
                    if msg.rnarg == 0 {
                        return ParseResult::Ok;
                    }
                    continue;
                }
                msg.kind = MsgKind::RespInteger;
                msg.integer = v.max(0) as u64;
                return ParseResult::Ok;
            }
            b'$' => {
                // A null bulk ($-1) has no body.
                if line == b"-1" {
                    msg.pos = end + 2;
                    if in_multibulk {
                        msg.rnarg -= 1;
                        if msg.rnarg == 0 {
                            return ParseResult::Ok;
                        }
                        continue;
                    }
                    msg.kind = MsgKind::RespBulk;
                    return ParseResult::Ok;
                }
                let n = match parse_dec(line) {
                    Some(n) => n as usize,
                    None => return ParseResult::Error,
                };
                if in_multibulk {
                    msg.rnarg -= 1;
                } else {
                    msg.kind = MsgKind::RespBulk;
                    msg.vlen = n as u32;
                }
                msg.rlen = n as u32;
                msg.pos = end + 2;
                msg.state = ParseState::ValueBody { remaining: n + 2 };
            }
            b'*' => {
                if in_multibulk {
                    // Nested arrays are not part of this proxy's surface.
                    return ParseResult::Error;
                }
                let n = match parse_int(line) {
                    Some(n) => n,
                    None => return ParseResult::Error,
                };
                msg.kind = MsgKind::RespMultibulk;
                msg.pos = end + 2;
                if n <= 0 {
                    msg.narg = 0;
                    return ParseResult::Ok;
                }
                msg.narg = n as u32;
                msg.rnarg = n as u32;
            }
            _ => return ParseResult::Error,
        }
    }
}

fn parse_int(tok: &[u8]) -> Option<i64> {
    if let Some(rest) = tok.strip_prefix(b"-") {
        parse_dec(rest).map(|v| -(v as i64))
    } else {
        parse_dec(tok).map(|v| v as i64)
    }
}
