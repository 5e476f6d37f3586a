//! End-to-end bridge scenarios
//!
//! The SIP side talks to a scripted PBX on a loopback UDP socket; the
//! modem side runs on an in-memory port. Timer scenarios run under
//! tokio's paused clock so deadlines are advanced, not awaited.

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use pstnlink::bridge::{Bridge, CallOrigin};
use pstnlink::config::{Config, DTMF_DIGITS};
use pstnlink::line::{Line, LineState, ModemPort};
use pstnlink::sip::digest::{compute_response, DigestAlgorithm, DigestChallenge};
use pstnlink::sip::{IpPhone, PhoneState};

// ---------------------------------------------------------------------------
// workspace: prompts live in the working directory
// ---------------------------------------------------------------------------

static WORKSPACE: Once = Once::new();

fn setup_workspace() {
    WORKSPACE.call_once(|| {
        let dir = std::env::temp_dir().join(format!("pstnlink-it-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::env::set_current_dir(&dir).unwrap();
        write_wav("dial.wav", &vec![0x80u8; 800]);
        write_wav("ringback.wav", &vec![0x80u8; 800]);
    });
}

/// Minimal RIFF/WAVE writer: mono, 8 kHz, 8-bit unsigned PCM.
fn write_wav(path: &str, samples: &[u8]) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + samples.len() as u32).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&8000u32.to_le_bytes());
    bytes.extend_from_slice(&8000u32.to_le_bytes()); // byte rate
    bytes.extend_from_slice(&1u16.to_le_bytes()); // block align
    bytes.extend_from_slice(&8u16.to_le_bytes()); // bits per sample
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    bytes.extend_from_slice(samples);
    std::fs::write(path, bytes).unwrap();
}

// ---------------------------------------------------------------------------
// fake modem port
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeInner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    replies: HashMap<Vec<u8>, Vec<u8>>,
}

#[derive(Clone, Default)]
struct FakePort {
    inner: Arc<Mutex<FakeInner>>,
}

impl FakePort {
    fn new() -> Self {
        let port = Self::default();
        // Voice duplex answers CONNECT; every other AT command gets OK.
        port.set_reply(b"AT+VTR\r\n", b"CONNECT\r\n");
        port.set_reply(&[0x10, b'^'], &[0x10, 0x03]);
        port
    }

    fn set_reply(&self, cmd: &[u8], reply: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .replies
            .insert(cmd.to_vec(), reply.to_vec());
    }

    fn push_rx(&self, data: &[u8]) {
        self.inner.lock().unwrap().rx.extend(data);
    }

    fn tx(&self) -> Vec<u8> {
        self.inner.lock().unwrap().tx.clone()
    }
}

impl ModemPort for FakePort {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().unwrap().rx.drain(..).collect())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tx.extend_from_slice(data);
        let is_command = data.starts_with(b"AT") || data.starts_with(&[0x10]);
        if is_command {
            let reply = inner
                .replies
                .get(data)
                .cloned()
                .unwrap_or_else(|| b"OK\r\n".to_vec());
            inner.rx.extend(reply);
        }
        Ok(())
    }

    fn in_queue_len(&mut self) -> usize {
        self.inner.lock().unwrap().rx.len()
    }

    fn out_queue_len(&mut self) -> usize {
        0
    }

    fn clear_queues(&mut self) -> Result<()> {
        self.inner.lock().unwrap().rx.clear();
        Ok(())
    }
}

fn tx_contains(port: &FakePort, needle: &[u8]) -> bool {
    let tx = port.tx();
    tx.windows(needle.len()).any(|w| w == needle)
}

// ---------------------------------------------------------------------------
// fake PBX / SIP peer
// ---------------------------------------------------------------------------

struct FakePbx {
    socket: UdpSocket,
}

impl FakePbx {
    fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        Self { socket }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    fn try_recv(&self) -> Option<(String, SocketAddr)> {
        let mut buf = [0u8; 4096];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => Some((String::from_utf8_lossy(&buf[..len]).to_string(), from)),
            Err(_) => None,
        }
    }

    /// Pump the system under test until a datagram arrives.
    fn recv_with(&self, mut pump: impl FnMut()) -> Option<(String, SocketAddr)> {
        for _ in 0..400 {
            if let Some(got) = self.try_recv() {
                return Some(got);
            }
            pump();
            std::thread::sleep(Duration::from_millis(2));
        }
        None
    }

    fn send(&self, text: &str, to: SocketAddr) {
        self.socket.send_to(text.as_bytes(), to).unwrap();
    }
}

fn header_line<'a>(msg: &'a str, name: &str) -> Option<&'a str> {
    msg.lines()
        .find(|l| l.to_ascii_lowercase().starts_with(&name.to_ascii_lowercase()))
}

/// Build a response that echoes the request's Via stack, From, To (plus a
/// tag), Call-ID and CSeq, the way a well-behaved UAS would.
fn reply(req: &str, status: u16, reason: &str, to_tag: Option<&str>, extra: &str, body: &str) -> String {
    let mut resp = format!("SIP/2.0 {} {}\r\n", status, reason);
    for via in req.lines().filter(|l| l.starts_with("Via:")) {
        resp += via;
        resp += "\r\n";
    }
    resp += header_line(req, "From:").unwrap();
    resp += "\r\n";
    let to = header_line(req, "To:").unwrap();
    resp += to;
    if let Some(tag) = to_tag {
        if !to.contains("tag=") {
            resp += &format!(";tag={}", tag);
        }
    }
    resp += "\r\n";
    resp += header_line(req, "Call-ID:").unwrap();
    resp += "\r\n";
    resp += header_line(req, "CSeq:").unwrap();
    resp += "\r\n";
    resp += extra;
    if body.is_empty() {
        resp += "Content-Length: 0\r\n\r\n";
    } else {
        resp += "Content-Type: application/sdp\r\n";
        resp += &format!("Content-Length: {}\r\n\r\n", body.len());
        resp += body;
    }
    resp
}

fn sdp_answer(ip: &str, port: u16) -> String {
    format!(
        "v=0\r\no=pbx 1 1 IN IP4 {ip}\r\ns=-\r\nc=IN IP4 {ip}\r\nt=0 0\r\n\
         m=audio {port} RTP/AVP 0 101\r\n\
         a=rtpmap:0 PCMU/8000\r\na=rtpmap:101 telephone-event/8000\r\n"
    )
}

fn extract_media_port(msg: &str) -> u16 {
    let line = msg.lines().find(|l| l.starts_with("m=audio ")).expect("m= line");
    line.split_whitespace().nth(1).unwrap().parse().unwrap()
}

fn extract_branch(msg: &str) -> String {
    let line = header_line(msg, "Via:").expect("Via");
    let pos = line.find("branch=").expect("branch") + 7;
    line[pos..]
        .chars()
        .take_while(|c| *c != ';' && *c != '\r')
        .collect()
}

fn auth_params(msg: &str, header: &str) -> HashMap<String, String> {
    let line = header_line(msg, header).expect("auth header");
    let value = line.splitn(2, ':').nth(1).unwrap().trim();
    let value = value.strip_prefix("Digest").unwrap_or(value).trim();
    value
        .split(", ")
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}

fn test_config(pbx_port: u16, extra: &[(&str, &str)]) -> Arc<Config> {
    let port_s = pbx_port.to_string();
    let mut map: HashMap<&str, &str> = HashMap::from([
        ("IP_PBX_USER", "1001"),
        ("IP_PBX_DOMAIN", "pbx.example.com"),
        ("IP_PBX_PASS", "secret"),
        ("IP_PHONE_IP", "127.0.0.1"),
        ("IP_PHONE_PORT", "0"),
        ("IP_PBX_PROXY_ADDRESS", "127.0.0.1"),
        ("CALL_FORWARD_TO", "1000@pbx.example.com"),
    ]);
    map.insert("IP_PBX_PROXY_PORT", port_s.as_str());
    for (k, v) in extra {
        map.insert(k, v);
    }
    Arc::new(Config::from_map(&map).unwrap())
}

fn wait_phone_state(phone: &mut IpPhone, wanted: PhoneState) {
    for _ in 0..400 {
        if phone.state() == wanted {
            return;
        }
        phone.poll();
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("phone never reached {:?} (now {:?})", wanted, phone.state());
}

fn register_phone(phone: &mut IpPhone, pbx: &FakePbx) -> SocketAddr {
    phone.start().unwrap();
    let (register, phone_addr) = pbx.recv_with(|| phone.poll()).expect("REGISTER");
    assert!(register.starts_with("REGISTER sip:pbx.example.com SIP/2.0"));
    pbx.send(&reply(&register, 200, "OK", Some("regtag"), "", ""), phone_addr);
    wait_phone_state(phone, PhoneState::Idle);
    phone_addr
}

fn rtp_peer() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_nonblocking(true).unwrap();
    socket
}

fn rtp_recv(socket: &UdpSocket, mut pump: impl FnMut()) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = [0u8; 2048];
    for _ in 0..400 {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => return Some((buf[..len].to_vec(), from)),
            Err(_) => {
                pump();
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
    None
}

fn audio_packet(payload_byte: u8, seq: u16) -> Vec<u8> {
    let mut packet = vec![0x80, 0x00];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&(seq as u32 * 160).to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 9]);
    packet.extend(std::iter::repeat(payload_byte).take(160));
    packet
}

fn event_packet(digit: char, seq: u16) -> Vec<u8> {
    let event = DTMF_DIGITS.find(digit).unwrap() as u8;
    let mut packet = vec![0x80, 0x80 | 101];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&(seq as u32).to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 9]);
    packet.extend_from_slice(&[event, 0x0A, 0x00, 0xA0]);
    packet
}

// ---------------------------------------------------------------------------
// scenario 1: outbound call
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_outbound_call_establishes_dialog_and_rtp() {
    setup_workspace();
    let pbx = FakePbx::new();
    let config = test_config(pbx.port(), &[]);
    let mut phone = IpPhone::new(config);
    register_phone(&mut phone, &pbx);

    phone.call("5551234", "bob@pbx.example.com");
    let (invite, phone_addr) = pbx.recv_with(|| phone.poll()).expect("INVITE");
    assert!(invite.starts_with("INVITE sip:bob@pbx.example.com SIP/2.0"));
    assert!(invite.contains("From: \"5551234\""), "caller id as display name");
    let sdp_line = invite.lines().find(|l| l.starts_with("m=audio ")).unwrap();
    assert!(sdp_line.ends_with("RTP/AVP 0 101"), "offer lists PCMU and telephone-event");
    let rtp_port = extract_media_port(&invite);
    assert!((10000..=20000).contains(&rtp_port), "RTP port from the configured range");
    let invite_branch = extract_branch(&invite);

    pbx.send(&reply(&invite, 100, "Trying", None, "", ""), phone_addr);
    pbx.send(&reply(&invite, 180, "Ringing", Some("tt1"), "", ""), phone_addr);

    let pbx_rtp = rtp_peer();
    let sdp = sdp_answer("127.0.0.1", pbx_rtp.local_addr().unwrap().port());
    pbx.send(
        &reply(&invite, 200, "OK", Some("tt1"), "Contact: <sip:bob@127.0.0.1>\r\n", &sdp),
        phone_addr,
    );
    wait_phone_state(&mut phone, PhoneState::Connected);

    let (ack, _) = pbx.recv_with(|| phone.poll()).expect("ACK");
    assert!(ack.starts_with("ACK sip:bob@127.0.0.1 SIP/2.0"), "ACK goes to the Contact");
    assert_ne!(extract_branch(&ack), invite_branch, "2xx ACK uses a fresh branch");

    // The RTP socket is live and bound to the advertised port.
    assert_eq!(phone.rtp_local_port(), Some(rtp_port));
    phone.write_audio(&vec![0x80u8; 160]);
    let (packet, from) = rtp_recv(&pbx_rtp, || phone.poll()).expect("RTP frame");
    assert_eq!(from.port(), rtp_port);
    assert_eq!(packet.len(), 12 + 160);
    assert_eq!(packet[1] & 0x7F, 0, "PCMU negotiated");
}

// ---------------------------------------------------------------------------
// scenario 2: digest challenge on REGISTER, nc increments per retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_challenge_and_nonce_counter() {
    setup_workspace();
    let pbx = FakePbx::new();
    let config = test_config(pbx.port(), &[]);
    let mut phone = IpPhone::new(config);
    phone.start().unwrap();

    let (first, phone_addr) = pbx.recv_with(|| phone.poll()).expect("REGISTER");
    assert!(!first.contains("Authorization:"));
    pbx.send(
        &reply(
            &first,
            401,
            "Unauthorized",
            Some("rt"),
            "WWW-Authenticate: Digest realm=\"pbx\", nonce=\"n1\", qop=\"auth\"\r\n",
            "",
        ),
        phone_addr,
    );

    let (second, _) = pbx.recv_with(|| phone.poll()).expect("authenticated REGISTER");
    let params = auth_params(&second, "Authorization:");
    assert_eq!(params["nc"], "00000001");
    assert_eq!(params["realm"], "pbx");
    assert_eq!(params["nonce"], "n1");
    let cnonce = params["cnonce"].clone();
    assert_eq!(cnonce.len(), 32);

    let challenge = DigestChallenge {
        realm: "pbx".to_string(),
        nonce: "n1".to_string(),
        algorithm: DigestAlgorithm::Md5,
        qop: Some("auth".to_string()),
        opaque: None,
        stale: false,
    };
    let expected = compute_response(
        &challenge,
        "1001",
        "secret",
        "REGISTER",
        "sip:1001@pbx.example.com",
        Some("00000001"),
        Some(&cnonce),
    );
    assert_eq!(params["response"], expected, "RFC 2617 digest response");

    // A second challenge with a fresh nonce gets nc=00000002.
    pbx.send(
        &reply(
            &second,
            401,
            "Unauthorized",
            Some("rt"),
            "WWW-Authenticate: Digest realm=\"pbx\", nonce=\"n2\", qop=\"auth\"\r\n",
            "",
        ),
        phone_addr,
    );
    let (third, _) = pbx.recv_with(|| phone.poll()).expect("second retry");
    let params = auth_params(&third, "Authorization:");
    assert_eq!(params["nc"], "00000002");
    assert_eq!(params["nonce"], "n2");

    pbx.send(&reply(&third, 200, "OK", Some("rt"), "", ""), phone_addr);
    wait_phone_state(&mut phone, PhoneState::Idle);
}

// ---------------------------------------------------------------------------
// registration refresh fires before expiry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_register_refresh_reuses_call_id() {
    setup_workspace();
    let pbx = FakePbx::new();
    let config = test_config(pbx.port(), &[]);
    let mut phone = IpPhone::new(config);
    phone.start().unwrap();

    let (first, phone_addr) = pbx.recv_with(|| phone.poll()).expect("REGISTER");
    pbx.send(&reply(&first, 200, "OK", Some("rt"), "", ""), phone_addr);
    wait_phone_state(&mut phone, PhoneState::Idle);

    // Refresh is scheduled at expires - 5 = 55 s.
    tokio::time::advance(Duration::from_secs(56)).await;
    let (refresh, _) = pbx.recv_with(|| phone.poll()).expect("refresh REGISTER");
    assert!(refresh.starts_with("REGISTER "));

    let call_id = |m: &str| header_line(m, "Call-ID:").unwrap().to_string();
    assert_eq!(call_id(&first), call_id(&refresh), "registration Call-ID is persistent");
    assert_eq!(phone.state(), PhoneState::Idle, "refresh does not leave IDLE");
}

// ---------------------------------------------------------------------------
// scenario 3 + 6: PSTN call forwarded to SIP, then session timeout
// ---------------------------------------------------------------------------

struct PstnCall {
    phone_addr: SocketAddr,
    pbx_rtp: UdpSocket,
    invite: String,
}

/// Ring the line once, let the bridge forward to CALL_FORWARD_TO, answer
/// the INVITE and run until cross-connected.
fn establish_pstn_call(bridge: &mut Bridge, pbx: &FakePbx, modem: &FakePort) -> PstnCall {
    bridge.start().unwrap();
    let (register, phone_addr) = pbx.recv_with(|| bridge.tick()).expect("REGISTER");
    pbx.send(&reply(&register, 200, "OK", Some("rt"), "", ""), phone_addr);
    for _ in 0..20 {
        bridge.tick();
        if bridge.phone().state() == PhoneState::Idle {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(bridge.phone().state(), PhoneState::Idle);

    modem.push_rx(b"\r\nRING\r\n");
    bridge.tick(); // line.poll sees the ring
    assert_eq!(bridge.line().state(), LineState::Ringing);

    let (invite, _) = pbx.recv_with(|| bridge.tick()).expect("forwarded INVITE");
    assert!(invite.starts_with("INVITE sip:1000@pbx.example.com SIP/2.0"));
    assert_eq!(bridge.call_from(), Some(CallOrigin::FromPstn));
    assert!(bridge.prompt_active(), "ringback prompt toward the PSTN side");
    assert!(tx_contains(modem, b"AT+FCLASS=8\r\n"), "line lifted to voice mode");
    assert!(tx_contains(modem, b"AT+VTR\r\n"));

    let pbx_rtp = rtp_peer();
    let sdp = sdp_answer("127.0.0.1", pbx_rtp.local_addr().unwrap().port());
    pbx.send(
        &reply(&invite, 200, "OK", Some("tt"), "Contact: <sip:1000@127.0.0.1>\r\n", &sdp),
        phone_addr,
    );
    for _ in 0..100 {
        bridge.tick();
        if bridge.is_cross_connected() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(bridge.is_cross_connected());
    let (ack, _) = pbx.recv_with(|| bridge.tick()).expect("ACK");
    assert!(ack.starts_with("ACK "));

    PstnCall { phone_addr, pbx_rtp, invite }
}

#[tokio::test(start_paused = true)]
async fn test_pstn_forward_then_session_timeout() {
    setup_workspace();
    let pbx = FakePbx::new();
    let config = test_config(pbx.port(), &[("ANSWER_AFTER_RINGS", "1")]);
    let modem = FakePort::new();
    let handle = modem.clone();
    handle.set_reply(b"AT+VRID=0\r\n", b"\r\nNMBR=5551234\r\nOK\r\n");

    let phone = IpPhone::new(config.clone());
    let line = Line::new(Box::new(modem), config.clone());
    let mut bridge = Bridge::new(config, phone, line);

    let call = establish_pstn_call(&mut bridge, &pbx, &handle);
    assert!(
        call.invite.contains("From: \"5551234\""),
        "caller ID presented on the forwarded call"
    );
    assert!(!bridge.prompt_active(), "prompt stops at cross-connect");

    // Hold the call past MAX_SESSION_DURATION; one tick tears down both legs.
    tokio::time::advance(Duration::from_secs(181)).await;
    bridge.tick();
    assert!(!bridge.is_cross_connected());
    assert_ne!(bridge.line().state(), LineState::Connected);

    let (bye, _from) = pbx.recv_with(|| bridge.tick()).expect("BYE");
    assert!(bye.starts_with("BYE "));
    assert!(tx_contains(&handle, b"AT+VLS=0\r\n"), "line back on-hook");
    assert!(tx_contains(&handle, b"AT+FCLASS=0\r\n"), "modem back in data mode");

    pbx.send(&reply(&bye, 200, "OK", None, "", ""), call.phone_addr);
    for _ in 0..100 {
        bridge.tick();
        if bridge.phone().state() == PhoneState::Idle {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(bridge.phone().state(), PhoneState::Idle);
}

// ---------------------------------------------------------------------------
// scenario 5: echo suppression substitutes silence toward SIP
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_echo_suppression_silences_sip_leg() {
    setup_workspace();
    let pbx = FakePbx::new();
    let config = test_config(
        pbx.port(),
        &[("ECHO_CANCEL_DELTA", "5"), ("ECHO_CANCEL_TIME", "0.2")],
    );
    let modem = FakePort::new();
    let handle = modem.clone();
    handle.set_reply(b"AT+VRID=0\r\n", b"\r\nNMBR=5551234\r\nOK\r\n");

    let phone = IpPhone::new(config.clone());
    let line = Line::new(Box::new(modem), config.clone());
    let mut bridge = Bridge::new(config, phone, line);
    let call = establish_pstn_call(&mut bridge, &pbx, &handle);

    // Loud SIP-side audio (u-law 0x80 decodes well above the bias) arms
    // the suppression window when it is written toward the line.
    call.pbx_rtp
        .send_to(&audio_packet(0x80, 1), call.phone_addr_rtp())
        .unwrap();
    for _ in 0..50 {
        bridge.tick();
        if tx_contains(&handle, &[0xFD]) {
            break; // frame reached the modem
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    // The next PSTN frame must reach RTP as pure silence (u-law 0xFF).
    handle.push_rx(&vec![200u8; 160]);
    let (packet, _) = rtp_recv(&call.pbx_rtp, || bridge.tick()).expect("RTP during suppression");
    assert_eq!(packet[1] & 0x7F, 0, "audio packet");
    assert!(
        packet[12..].iter().all(|&b| b == 0xFF),
        "suppressed frame is silence at the bias"
    );
}

impl PstnCall {
    fn phone_addr_rtp(&self) -> SocketAddr {
        // INVITE advertised the phone's RTP port in its SDP offer.
        SocketAddr::new("127.0.0.1".parse().unwrap(), extract_media_port(&self.invite))
    }
}

// ---------------------------------------------------------------------------
// DTMF relay both directions
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_dtmf_relays_between_legs() {
    setup_workspace();
    let pbx = FakePbx::new();
    let config = test_config(pbx.port(), &[]);
    let modem = FakePort::new();
    let handle = modem.clone();
    handle.set_reply(b"AT+VRID=0\r\n", b"\r\nNMBR=5551234\r\nOK\r\n");

    let phone = IpPhone::new(config.clone());
    let line = Line::new(Box::new(modem), config.clone());
    let mut bridge = Bridge::new(config, phone, line);
    let call = establish_pstn_call(&mut bridge, &pbx, &handle);

    // SIP -> PSTN: an RFC 2833 event becomes AT+VTS on the modem.
    call.pbx_rtp
        .send_to(&event_packet('5', 2), call.phone_addr_rtp())
        .unwrap();
    for _ in 0..100 {
        bridge.tick();
        if tx_contains(&handle, b"AT+VTS=5\r\n") {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(tx_contains(&handle, b"AT+VTS=5\r\n"));

    // PSTN -> SIP: a DLE-shielded digit becomes a marker event packet.
    let mut frame = vec![0x80u8; 160];
    frame[20] = 0x10;
    frame[21] = b'7';
    handle.push_rx(&frame);
    let event = loop {
        let (packet, _) = rtp_recv(&call.pbx_rtp, || bridge.tick()).expect("RTP packet");
        if packet[1] == (0x80 | 101) {
            break packet;
        }
    };
    assert_eq!(event[12], 7, "event id for digit 7");
}

// ---------------------------------------------------------------------------
// inbound IP call: dial prompt, dial plan, outbound line dial
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_ip_call_collects_digits_and_dials_line() {
    setup_workspace();
    let pbx = FakePbx::new();
    let config = test_config(pbx.port(), &[]);
    let modem = FakePort::new();
    let handle = modem.clone();

    let phone = IpPhone::new(config.clone());
    let line = Line::new(Box::new(modem), config.clone());
    let mut bridge = Bridge::new(config, phone, line);
    bridge.start().unwrap();

    let (register, phone_addr) = pbx.recv_with(|| bridge.tick()).expect("REGISTER");
    pbx.send(&reply(&register, 200, "OK", Some("rt"), "", ""), phone_addr);
    for _ in 0..20 {
        bridge.tick();
        if bridge.phone().state() == PhoneState::Idle {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    // The PBX invites us; the bridge should ring, answer, then prompt.
    let pbx_rtp = rtp_peer();
    let sdp = sdp_answer("127.0.0.1", pbx_rtp.local_addr().unwrap().port());
    let invite = format!(
        "INVITE sip:1001@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKitest1\r\n\
         From: \"Desk\" <sip:2000@pbx.example.com>;tag=ft9\r\n\
         To: <sip:1001@pbx.example.com>\r\n\
         Call-ID: inbound-1\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:2000@127.0.0.1:{}>\r\n\
         Max-Forwards: 70\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{}",
        pbx.port(),
        pbx.port(),
        sdp.len(),
        sdp
    );
    pbx.send(&invite, phone_addr);

    let (ringing, _) = pbx.recv_with(|| bridge.tick()).expect("180");
    assert!(ringing.starts_with("SIP/2.0 180 Ringing"));
    let (ok, _) = pbx.recv_with(|| bridge.tick()).expect("200");
    assert!(ok.starts_with("SIP/2.0 200 OK"));
    assert!(ok.contains("m=audio "), "answer carries SDP");
    let phone_rtp_port = extract_media_port(&ok);
    let to_tag_pos = ok.lines().find(|l| l.starts_with("To:")).unwrap();
    let to_tag: String = to_tag_pos
        .split("tag=")
        .nth(1)
        .unwrap()
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();

    let ack = format!(
        "ACK sip:1001@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKitest2\r\n\
         From: \"Desk\" <sip:2000@pbx.example.com>;tag=ft9\r\n\
         To: <sip:1001@pbx.example.com>;tag={}\r\n\
         Call-ID: inbound-1\r\n\
         CSeq: 1 ACK\r\n\
         Content-Length: 0\r\n\r\n",
        pbx.port(),
        to_tag
    );
    pbx.send(&ack, phone_addr);
    for _ in 0..50 {
        bridge.tick();
        if bridge.phone().state() == PhoneState::Connected && bridge.prompt_active() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(bridge.phone().state(), PhoneState::Connected);
    assert_eq!(bridge.call_from(), Some(CallOrigin::FromIp));
    assert!(bridge.prompt_active(), "dial prompt plays toward the caller");

    // Dial 0 + 10 digits: an outside number per the dial plan.
    let number = "05551234567";
    for (i, digit) in number.chars().enumerate() {
        pbx_rtp
            .send_to(
                &event_packet(digit, 10 + i as u16),
                SocketAddr::new("127.0.0.1".parse().unwrap(), phone_rtp_port),
            )
            .unwrap();
        for _ in 0..20 {
            bridge.tick();
            std::thread::sleep(Duration::from_millis(1));
            if bridge.is_cross_connected() {
                break;
            }
        }
    }

    assert!(bridge.is_cross_connected(), "dialed number cross-connects");
    assert!(tx_contains(&handle, b"ATD05551234567;\r\n"), "line dialed the collected number");
}

// ---------------------------------------------------------------------------
// concurrent INVITE on another Call-ID is refused busy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_invite_rejected_busy() {
    setup_workspace();
    let pbx = FakePbx::new();
    let config = test_config(pbx.port(), &[]);
    let mut phone = IpPhone::new(config);
    register_phone(&mut phone, &pbx);

    phone.call("", "bob@pbx.example.com");
    let (invite, phone_addr) = pbx.recv_with(|| phone.poll()).expect("INVITE");
    let pbx_rtp = rtp_peer();
    let sdp = sdp_answer("127.0.0.1", pbx_rtp.local_addr().unwrap().port());
    pbx.send(&reply(&invite, 200, "OK", Some("tt"), "", &sdp), phone_addr);
    wait_phone_state(&mut phone, PhoneState::Connected);
    let _ = pbx.recv_with(|| phone.poll()).expect("ACK");

    let second = format!(
        "INVITE sip:1001@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKother\r\n\
         From: <sip:3000@pbx.example.com>;tag=o1\r\n\
         To: <sip:1001@pbx.example.com>\r\n\
         Call-ID: another-call\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
        pbx.port()
    );
    pbx.send(&second, phone_addr);
    let (busy, _) = pbx.recv_with(|| phone.poll()).expect("486");
    assert!(busy.starts_with("SIP/2.0 486 Busy Here"));
    assert_eq!(phone.state(), PhoneState::Connected, "active call untouched");
}
