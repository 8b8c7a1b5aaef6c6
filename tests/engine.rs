//! End-to-end engine scenarios driven through a scripted connection.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::time::Duration;

use braid::{
    crypto, AesKey, Config, ConnId, Connection, Engine, Family, MsgKind, MsgToken, Role,
};

struct MockConn {
    id: ConnId,
    family: Family,
    replication: bool,
    role: Role,
    recv_request: bool,
    timeout: Option<Duration>,
    key: Option<AesKey>,

    script: VecDeque<Vec<u8>>,
    rmsg: Option<MsgToken>,
    recv_events: Vec<(MsgToken, Option<MsgToken>)>,
    recv_ready: bool,

    outq: Vec<MsgToken>,
    smsg_idx: Option<usize>,
    sendv_script: VecDeque<io::Result<usize>>,
    sendv_captured: Vec<Vec<u8>>,
    sent_done: Vec<MsgToken>,
    send_ready: bool,

    err: Option<io::ErrorKind>,
}

impl MockConn {
    fn new(family: Family, replication: bool, recv_request: bool) -> Self {
        MockConn {
            id: ConnId(1),
            family,
            replication,
            role: if replication { Role::Server } else { Role::Client },
            recv_request,
            timeout: None,
            key: None,
            script: VecDeque::new(),
            rmsg: None,
            recv_events: Vec::new(),
            recv_ready: false,
            outq: Vec::new(),
            smsg_idx: None,
            sendv_script: VecDeque::new(),
            sendv_captured: Vec::new(),
            sent_done: Vec::new(),
            send_ready: false,
            err: None,
        }
    }

    fn client(family: Family) -> Self {
        Self::new(family, false, true)
    }

    fn peer(family: Family, key: Option<AesKey>) -> Self {
        let mut c = Self::new(family, true, true);
        c.key = key;
        c
    }

    fn push_recv(&mut self, bytes: &[u8]) {
        self.script.push_back(bytes.to_vec());
    }
}

impl Connection for MockConn {
    fn id(&self) -> ConnId {
        self.id
    }

    fn family(&self) -> Family {
        self.family
    }

    fn replication(&self) -> bool {
        self.replication
    }

    fn role(&self) -> Role {
        self.role
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn aes_key(&self) -> Option<&AesKey> {
        self.key.as_ref()
    }

    fn recv_ready(&self) -> bool {
        self.recv_ready
    }

    fn set_recv_ready(&mut self, ready: bool) {
        self.recv_ready = ready;
    }

    fn send_ready(&self) -> bool {
        self.send_ready
    }

    fn set_send_ready(&mut self, ready: bool) {
        self.send_ready = ready;
    }

    fn err(&self) -> Option<io::ErrorKind> {
        self.err
    }

    fn set_err(&mut self, err: io::ErrorKind) {
        self.err = Some(err);
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.pop_front() {
            None => {
                self.recv_ready = false;
                Err(io::ErrorKind::WouldBlock.into())
            }
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.script.push_front(chunk.split_off(n));
                }
                if self.script.is_empty() {
                    self.recv_ready = false;
                }
                Ok(n)
            }
        }
    }

    fn sendv(&mut self, iovs: &[IoSlice<'_>], _total: usize) -> io::Result<usize> {
        let mut flat = Vec::new();
        for iov in iovs {
            flat.extend_from_slice(iov);
        }
        self.sendv_captured.push(flat);
        let r = self
            .sendv_script
            .pop_front()
            .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()));
        if self.sendv_script.is_empty() {
            self.send_ready = false;
        }
        r
    }

    fn recv_next(&mut self, engine: &mut Engine, alloc: bool) -> Option<MsgToken> {
        if self.rmsg.is_none() && alloc {
            self.rmsg = engine.msg_get(&*self, self.recv_request);
        }
        self.rmsg
    }

    fn send_next(&mut self, _engine: &mut Engine) -> Option<MsgToken> {
        let next = match self.smsg_idx {
            None => 0,
            Some(i) => i + 1,
        };
        if next < self.outq.len() {
            self.smsg_idx = Some(next);
            Some(self.outq[next])
        } else {
            self.smsg_idx = None;
            None
        }
    }

    fn recv_done(&mut self, _engine: &mut Engine, msg: MsgToken, next: Option<MsgToken>) {
        self.recv_events.push((msg, next));
        self.rmsg = next;
    }

    fn send_done(&mut self, _engine: &mut Engine, msg: MsgToken) {
        self.sent_done.push(msg);
        self.outq.retain(|t| *t != msg);
    }

    fn smsg(&self) -> Option<MsgToken> {
        self.smsg_idx.map(|i| self.outq[i])
    }

    fn set_smsg(&mut self, msg: Option<MsgToken>) {
        if msg.is_none() {
            self.smsg_idx = None;
        }
    }
}

fn engine() -> Engine {
    Engine::new(Config::default()).unwrap()
}

// ── Receive path ────────────────────────────────────────────────────────

#[test]
fn single_command_one_read() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);
    c.push_recv(b"get foo\r\n");

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 1);
    let (tok, next) = c.recv_events[0];
    assert!(next.is_none());
    let m = e.msg(tok);
    assert_eq!(m.kind, MsgKind::McGet);
    assert_eq!(m.key_bytes().unwrap(), b"foo");
    assert_eq!(m.mlen, 9);
    assert_eq!(m.mlen as usize, m.recomputed_len());
}

#[test]
fn two_commands_coalesced_in_one_read() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);
    c.push_recv(b"get foo\r\nget bar\r\n");

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 2);
    let (m1, next1) = c.recv_events[0];
    let (m2, next2) = c.recv_events[1];
    assert_eq!(next1, Some(m2));
    assert!(next2.is_none());
    assert_eq!(e.msg(m1).mlen, 9);
    assert_eq!(e.msg(m2).mlen, 9);
    assert_eq!(e.msg(m1).key_bytes().unwrap(), b"foo");
    assert_eq!(e.msg(m2).key_bytes().unwrap(), b"bar");
}

#[test]
fn command_split_across_reads() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);
    c.push_recv(b"ge");
    c.push_recv(b"t foo\r\n");

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 1, "no hand-off until the frame completes");
    let (tok, _) = c.recv_events[0];
    assert_eq!(e.msg(tok).kind, MsgKind::McGet);
    assert_eq!(e.msg(tok).mlen, 9);
}

#[test]
fn bytes_arrive_one_at_a_time() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Resp);
    for b in b"*2\r\n$3\r\nget\r\n$3\r\nfoo\r\n" {
        c.push_recv(&[*b]);
    }

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 1);
    let (tok, _) = c.recv_events[0];
    let m = e.msg(tok);
    assert_eq!(m.kind, MsgKind::RespGet);
    assert_eq!(m.key_bytes().unwrap(), b"foo");
    assert_eq!(m.mlen, 22, "no loss and no reordering across reads");
}

// ── Fragmentation ───────────────────────────────────────────────────────

#[test]
fn multi_key_request_fragments_into_group() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Resp);
    c.push_recv(b"*4\r\n$4\r\nmget\r\n$3\r\nk1\r\n$3\r\nk2\r\n$3\r\nk3\r\n");

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 3);
    let (m1, n1) = c.recv_events[0];
    let (m2, n2) = c.recv_events[1];
    let (m3, n3) = c.recv_events[2];
    assert_eq!(n1, Some(m2));
    assert_eq!(n2, Some(m3));
    assert!(n3.is_none());

    let fid = e.msg(m1).frag_id;
    assert!(fid > 0);
    assert_eq!(e.msg(m2).frag_id, fid);
    assert_eq!(e.msg(m3).frag_id, fid);

    assert!(e.msg(m1).first_fragment);
    assert!(!e.msg(m1).last_fragment);
    assert_eq!(e.msg(m1).nfrag, 3);
    assert!(!e.msg(m2).first_fragment);
    assert!(!e.msg(m2).last_fragment);
    assert!(e.msg(m3).last_fragment);

    // Every sibling re-parses as a single-key command on the same group.
    assert_eq!(e.msg(m1).key_bytes().unwrap(), b"k1");
    assert_eq!(e.msg(m2).key_bytes().unwrap(), b"k2");
    assert_eq!(e.msg(m3).key_bytes().unwrap(), b"k3");
    assert_eq!(e.msg(m2).kind, MsgKind::RespMget);

    let bytes =
        |tok: MsgToken| e.msg(tok).chain.copy_range(0, e.msg(tok).recomputed_len() + 16);
    assert!(bytes(m3).ends_with(b"*2\r\n$4\r\nmget\r\n$3\r\nk3\r\n"));
    for tok in [m1, m2, m3] {
        assert_eq!(e.msg(tok).mlen as usize, e.msg(tok).recomputed_len());
        assert!(e.msg(tok).is_read);
    }
}

#[test]
fn memcache_multi_get_fragments_too() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);
    c.push_recv(b"get k1 k2\r\n");

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 2);
    let (m1, _) = c.recv_events[0];
    let (m2, _) = c.recv_events[1];
    assert_eq!(e.msg(m1).nfrag, 2);
    assert!(e.msg(m1).first_fragment);
    assert!(e.msg(m2).last_fragment);
    assert_eq!(e.msg(m1).frag_owner, Some(m1));
    assert_eq!(e.msg(m2).frag_owner, Some(m1));

    // Original restored to a valid single-key command, sibling re-emitted.
    let kept = e.msg(m1).chain.copy_range(0, e.msg(m1).recomputed_len());
    assert_eq!(kept, b"get k1 \r\n");
    let sib = e.msg(m2).chain.copy_range(0, e.msg(m2).recomputed_len());
    assert_eq!(sib, b"get k2\r\n");
}

// ── Send path ───────────────────────────────────────────────────────────

#[test]
fn partial_send_advances_cursor() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);

    let m1 = e.msg_get(&c, false).unwrap();
    e.msg_append(m1, &[b'a'; 100]);
    let m2 = e.msg_get(&c, false).unwrap();
    e.msg_append(m2, &[b'b'; 50]);
    c.outq = vec![m1, m2];
    c.sendv_script.push_back(Ok(120));

    e.msg_send(&mut c).unwrap();

    // First message completed; second's first segment advanced by 20.
    assert_eq!(c.sent_done, vec![m1]);
    assert_eq!(c.outq, vec![m2]);
    assert_eq!(e.msg(m2).chain.seg(0).pos, 20);

    // P7: what reached the wire is the queue's prefix.
    assert_eq!(c.sendv_captured.len(), 1);
    assert_eq!(c.sendv_captured[0].len(), 150);
    assert!(c.sendv_captured[0][..100].iter().all(|&b| b == b'a'));
    assert!(c.sendv_captured[0][100..].iter().all(|&b| b == b'b'));
}

#[test]
fn empty_ack_completes_on_zero_byte_send() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);

    let ack = e.msg_get(&c, false).unwrap();
    c.outq = vec![ack];
    // No sendv script: the write reports WouldBlock.

    e.msg_send(&mut c).unwrap();
    assert_eq!(c.sent_done, vec![ack]);
}

#[test]
fn fatal_send_error_sets_sticky_error() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);
    let m = e.msg_get(&c, false).unwrap();
    e.msg_append(m, b"VALUE k 0 1\r\nx\r\nEND\r\n");
    c.outq = vec![m];
    c.sendv_script
        .push_back(Err(io::ErrorKind::BrokenPipe.into()));

    assert!(e.msg_send(&mut c).is_err());
    assert_eq!(c.err, Some(io::ErrorKind::BrokenPipe));
}

// ── Pool ceilings ───────────────────────────────────────────────────────

#[test]
fn soft_and_hard_ceilings() {
    let cfg = Config {
        msg_soft_limit: 8,
        msg_hard_limit: 10,
        ..Config::default()
    };
    let mut e = Engine::new(cfg).unwrap();
    let client = MockConn::client(Family::Memcache);
    let peer = MockConn::peer(Family::Memcache, None);

    let mut held = Vec::new();
    for _ in 0..8 {
        held.push(e.msg_get(&client, true).expect("below soft ceiling"));
    }
    assert!(e.msg_get(&client, true).is_none(), "ninth client acquire fails");

    // The replication plane is never starved by client pressure.
    for _ in 0..2 {
        held.push(e.msg_get(&peer, true).expect("forced below hard ceiling"));
    }
    assert!(e.msg_get(&peer, true).is_none(), "hard ceiling is absolute");
    assert!(e.msg_get(&client, true).is_none());
}

// ── Timeout index ───────────────────────────────────────────────────────

#[test]
fn timeout_tracking_through_engine() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Resp);
    c.timeout = Some(Duration::from_millis(250));
    c.push_recv(b"*2\r\n$3\r\nget\r\n$3\r\nfoo\r\n");
    e.msg_recv(&mut c).unwrap();
    let (req, _) = c.recv_events[0];

    e.msg_tmo_insert(req, &c);
    let (min, deadline) = e.msg_tmo_min().expect("armed");
    assert_eq!(min, req);
    assert!(deadline >= 250);

    e.msg_tmo_delete(req);
    assert!(e.msg_tmo_min().is_none());
    // Idempotent.
    e.msg_tmo_delete(req);

    // Release also removes any live entry.
    e.msg_tmo_insert(req, &c);
    e.msg_put(req);
    assert!(e.msg_tmo_min().is_none());
}

#[test]
fn quit_and_noreply_requests_are_not_tracked() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);
    c.timeout = Some(Duration::from_millis(100));
    c.push_recv(b"set k 0 0 2 noreply\r\nhi\r\n");
    e.msg_recv(&mut c).unwrap();
    let (req, _) = c.recv_events[0];
    assert!(e.msg(req).noreply);

    e.msg_tmo_insert(req, &c);
    assert!(e.msg_tmo_min().is_none());
}

// ── Error handling ──────────────────────────────────────────────────────

#[test]
fn client_parse_error_fails_the_connection() {
    let mut e = engine();
    let mut c = MockConn::client(Family::Memcache);
    c.push_recv(b"bogus nonsense\r\n");

    assert!(e.msg_recv(&mut c).is_err());
    assert_eq!(c.err, Some(io::ErrorKind::InvalidData));
}

#[test]
fn replication_parse_error_is_swallowed() {
    let mut e = engine();
    let mut c = MockConn::peer(Family::Memcache, None);
    c.push_recv(b"not an envelope\r\n");

    e.msg_recv(&mut c).unwrap();
    assert!(c.err.is_none(), "peer transport stays up");
    let tok = c.rmsg.expect("frame is held, not handed off");
    assert!(e.msg(tok).error);
    assert!(e.msg(tok).swallow);
}

// ── Replication plane ───────────────────────────────────────────────────

#[test]
fn plaintext_envelope_frame() {
    let mut e = engine();
    let mut c = MockConn::peer(Family::Resp, None);
    let inner = b"*2\r\n$3\r\nget\r\n$3\r\nfoo\r\n";
    let mut wire = format!("#rp1 0 42 {}\r\n", inner.len()).into_bytes();
    wire.extend_from_slice(inner);
    c.push_recv(&wire);

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 1);
    let (tok, _) = c.recv_events[0];
    let m = e.msg(tok);
    assert_eq!(m.kind, MsgKind::RespGet);
    assert_eq!(m.key_bytes().unwrap(), b"foo");
    assert_eq!(m.dmsg.as_ref().unwrap().msg_id, 42);
}

#[test]
fn sealed_envelope_decrypts_and_parses() {
    let key = AesKey::from_bytes([7u8; 32]);
    let mut e = engine();
    let mut c = MockConn::peer(Family::Resp, Some(key.clone()));

    let inner = b"*2\r\n$3\r\nget\r\n$3\r\nfoo\r\n";
    let sealed = crypto::seal(inner, &key).unwrap();
    let mut wire = format!("#rp1 1 42 {}\r\n", sealed.len()).into_bytes();
    let header_len = wire.len();
    wire.extend_from_slice(&sealed);
    c.push_recv(&wire);

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 1);
    let (tok, _) = c.recv_events[0];
    let m = e.msg(tok);
    assert_eq!(m.kind, MsgKind::RespGet);
    assert_eq!(m.key_bytes().unwrap(), b"foo");
    let d = m.dmsg.as_ref().unwrap();
    assert!(!d.sealed(), "flag cleared after decryption");
    assert_eq!(d.plen, 0);
    assert_eq!(m.mlen as usize, header_len + inner.len());
    assert_eq!(m.mlen as usize, m.recomputed_len());
}

#[test]
fn sealed_envelope_split_across_reads() {
    let key = AesKey::from_bytes([7u8; 32]);
    let mut e = engine();
    let mut c = MockConn::peer(Family::Resp, Some(key.clone()));

    let inner = b"*2\r\n$3\r\nget\r\n$3\r\nbar\r\n";
    let sealed = crypto::seal(inner, &key).unwrap();
    let mut wire = format!("#rp1 1 7 {}\r\n", sealed.len()).into_bytes();
    wire.extend_from_slice(&sealed);

    // The preamble and half the ciphertext, then the rest.
    let cut = wire.len() - sealed.len() / 2;
    c.push_recv(&wire[..cut]);
    c.push_recv(&wire[cut..]);

    e.msg_recv(&mut c).unwrap();

    assert_eq!(c.recv_events.len(), 1);
    let (tok, _) = c.recv_events[0];
    assert_eq!(e.msg(tok).key_bytes().unwrap(), b"bar");
}

#[test]
fn tampered_sealed_payload_is_fatal() {
    let key = AesKey::from_bytes([7u8; 32]);
    let mut e = engine();
    let mut c = MockConn::peer(Family::Resp, Some(key.clone()));

    let sealed = crypto::seal(b"*1\r\n$4\r\nquit\r\n", &key).unwrap();
    let mut wire = format!("#rp1 1 7 {}\r\n", sealed.len()).into_bytes();
    wire.extend_from_slice(&sealed);
    let n = wire.len();
    wire[n - 1] ^= 0x01;
    c.push_recv(&wire);

    assert!(e.msg_recv(&mut c).is_err());
}
