/// SIP/RTP user agent
/// Reference: RFC 3261 (SIP), RFC 3264 (offer/answer)
///
/// One agent, one registration, at most one dialog at a time. Everything
/// is driven by `poll()` from the bridge tick: one datagram per call, or
/// timer service when the socket is quiet. Nothing here blocks.

use anyhow::{Context, Result};
use rand::Rng;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::digest::AuthState;
use super::message::{
    reason_phrase, Method, SipMessage, StartLine, Sdp, SS_BAD_REQUEST, SS_BUSY_HERE, SS_DECLINE,
    SS_FORBIDDEN, SS_NOT_ACCEPTABLE_HERE, SS_NOT_FOUND, SS_OK, SS_PROXY_AUTH_REQUIRED,
    SS_REQUEST_TERMINATED, SS_RINGING, SS_SERVICE_UNAVAILABLE, SS_TEMPORARILY_UNAVAILABLE,
    SS_TRANSACTION_DOES_NOT_EXIST, SS_TRYING, SS_PUSH_SENT, SS_UNAUTHORIZED,
};
use crate::config::{Config, DTMF_DIGITS};
use crate::rtp::{G711Codec, RtpSession, PT_EVENT, PT_PCMA, PT_PCMU};

const SIP_BUF_SIZE: usize = 4096;

/// Audio payload types we are willing to negotiate, in preference order.
const PREFERRED_AUDIO: [u8; 2] = [PT_PCMU, PT_PCMA];

/// Coarse agent state shared with the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneState {
    Inactive,
    Registering,
    Idle,
    Dialing,
    Ringing,
    Connected,
    Canceling,
    HangingUp,
    Deleting,
}

/// Registration lives independently of any call dialog.
#[derive(Debug, Default)]
struct Registration {
    call_id: String,
    my_tag: String,
    other_tag: String,
    counter: u32,
    retry_limit: u32,
    expires: u32,
    timer: Option<Instant>,
    refresh_at: Option<Instant>,
    auth: Option<AuthState>,
}

/// One call dialog, inbound or outbound.
#[derive(Debug, Default)]
struct Dialog {
    call_id: String,
    my_tag: String,
    other_tag: String,
    /// Target of in-dialog requests (request URI without scheme)
    other_contact: String,
    other_user: String,
    /// Display name presented on outbound INVITE (PSTN caller id)
    line_cid: String,
    /// Callee caller-id of an inbound call, candidate dial-out number
    ip_cid: String,
    branch: String,
    retry_limit: u32,
    rtp_local_port: u16,
    codec: Option<G711Codec>,
    event_pt: u8,
    remote_rtp: Option<SocketAddr>,
    remote_sdp: Option<Sdp>,
    /// Record-Route of the most recent dialog message, received order
    route_set: Vec<String>,
    /// The INVITE we still owe a final response (inbound)
    invite: Option<SipMessage>,
    auth: Option<AuthState>,
    response_timer: Option<Instant>,
    answer_timer: Option<Instant>,
}

pub struct IpPhone {
    config: Arc<Config>,
    uri: String,
    instance_uuid: uuid::Uuid,
    send_addr: Option<SocketAddr>,
    socket: Option<tokio::net::UdpSocket>,
    local_ip: IpAddr,
    local_port: u16,
    state: PhoneState,
    active: bool,
    registration: Registration,
    /// CSeq counter for dialog requests; persists across dialogs
    request_counter: u32,
    dialog: Option<Dialog>,
    rtp: Option<RtpSession>,
}

impl IpPhone {
    pub fn new(config: Arc<Config>) -> Self {
        let uri = format!("sip:{}@{}", config.sip_user, config.sip_domain);
        let local_ip = config
            .phone_ip
            .parse()
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        let local_port = config.phone_port;
        Self {
            config,
            uri,
            instance_uuid: uuid::Uuid::new_v4(),
            send_addr: None,
            socket: None,
            local_ip,
            local_port,
            state: PhoneState::Inactive,
            active: false,
            registration: Registration::default(),
            request_counter: 0,
            dialog: None,
            rtp: None,
        }
    }

    pub fn state(&self) -> PhoneState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn rtp_local_port(&self) -> Option<u16> {
        self.dialog.as_ref().map(|d| d.rtp_local_port)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Bind the SIP socket and start registering.
    pub fn start(&mut self) -> Result<()> {
        if self.active {
            warn!("IP phone already started");
            return Ok(());
        }
        let send_addr = (self.config.proxy_address.as_str(), self.config.proxy_port)
            .to_socket_addrs()
            .context("Failed to resolve SIP proxy")?
            .next()
            .context("No addresses found for SIP proxy")?;

        let std_socket =
            std::net::UdpSocket::bind(SocketAddr::new(self.local_ip, self.local_port))
                .context("Failed to bind SIP socket")?;
        std_socket
            .set_nonblocking(true)
            .context("Failed to set SIP socket non-blocking")?;
        self.local_port = std_socket.local_addr()?.port();
        self.socket = Some(
            tokio::net::UdpSocket::from_std(std_socket).context("Failed to register SIP socket")?,
        );
        self.send_addr = Some(send_addr);
        self.active = true;
        self.state = PhoneState::Registering;
        info!("SIP agent bound on {}:{}, proxy {}", self.local_ip, self.local_port, send_addr);
        self.register(self.config.register_expires);
        Ok(())
    }

    /// Hang up any call and deregister. The agent goes INACTIVE once the
    /// REGISTER Expires: 0 is answered (serviced by further polls).
    pub fn stop(&mut self) {
        if !self.active {
            warn!("IP phone already stopped");
            return;
        }
        if self.dialog.is_some() {
            self.hangup();
        }
        if self.registration.expires != 0 {
            self.register(0);
        }
    }

    fn inactivate(&mut self) {
        self.state = PhoneState::Inactive;
        self.registration = Registration::default();
        self.rtp_stop();
        self.dialog = None;
        self.socket = None;
        self.active = false;
    }

    /// (Re)send REGISTER. The registration Call-ID is allocated once and
    /// reused for every refresh.
    pub fn register(&mut self, expires: u32) {
        debug!("register: expires {}", expires);
        if self.registration.call_id.is_empty() {
            self.registration.call_id = generate_call_id();
        }
        self.registration.expires = expires;
        self.registration.timer = Some(Instant::now() + self.config.response_timeout);
        let req = self.build_register();
        self.sip_send(&req);
        self.registration.retry_limit = self.registration.counter + 2;
    }

    /// Start an outbound call. `line_cid` becomes the From display name.
    pub fn call(&mut self, line_cid: &str, other_user: &str) {
        debug!("call: cid '{}', target {}", line_cid, other_user);
        self.dialog = Some(Dialog {
            call_id: generate_call_id(),
            my_tag: generate_tag(),
            other_contact: other_user.to_string(),
            other_user: other_user.to_string(),
            line_cid: line_cid.to_string(),
            rtp_local_port: rand::thread_rng()
                .gen_range(self.config.rtp_low..=self.config.rtp_high),
            event_pt: PT_EVENT,
            response_timer: Some(Instant::now() + self.config.response_timeout),
            answer_timer: Some(Instant::now() + self.config.answer_timeout),
            ..Dialog::default()
        });
        self.state = PhoneState::Dialing;
        let req = self.build_request(Method::Invite, false);
        self.sip_send(&req);
        if let Some(d) = self.dialog.as_mut() {
            d.retry_limit = self.request_counter + 2;
        }
    }

    /// Answer the ringing inbound call: negotiate a codec from the stored
    /// INVITE offer and send 200 with an SDP answer. With no codec
    /// intersection the INVITE is refused with 488 and the call dropped.
    pub fn answer(&mut self) {
        debug!("answer");
        let invite = match self.dialog.as_ref().and_then(|d| d.invite.clone()) {
            Some(invite) => invite,
            None => {
                warn!("answer() without a pending INVITE");
                return;
            }
        };
        if !self.negotiate_media() {
            let resp = self.build_response(&invite, SS_NOT_ACCEPTABLE_HERE, false);
            self.sip_send(&resp);
            self.delete_call();
            return;
        }
        if let Some(d) = self.dialog.as_mut() {
            d.response_timer = Some(Instant::now() + self.config.response_timeout);
        }
        let resp = self.build_response(&invite, SS_OK, true);
        self.sip_send(&resp);
    }

    /// State-dependent teardown of the current dialog.
    pub fn hangup(&mut self) {
        match self.state {
            PhoneState::Connected => {
                self.state = PhoneState::HangingUp;
                if let Some(d) = self.dialog.as_mut() {
                    d.response_timer = Some(Instant::now() + self.config.response_timeout);
                }
                let req = self.build_request(Method::Bye, false);
                self.sip_send(&req);
                debug!("hangup: CONNECTED -> HANGINGUP, BYE sent");
            }
            PhoneState::Dialing => {
                self.state = PhoneState::Canceling;
                if let Some(d) = self.dialog.as_mut() {
                    d.response_timer = Some(Instant::now() + self.config.response_timeout);
                }
                let req = self.build_request(Method::Cancel, false);
                self.sip_send(&req);
                debug!("hangup: DIALING -> CANCELING, CANCEL sent");
            }
            PhoneState::Ringing => {
                // We never accepted the INVITE; drop it locally.
                self.delete_call();
                debug!("hangup: RINGING -> IDLE, call deleted");
            }
            _ => {}
        }
    }

    fn delete_call(&mut self) {
        if let Some(d) = &self.dialog {
            debug!("delete_call: {}", d.call_id);
        }
        self.rtp_stop();
        self.dialog = None;
        self.state = PhoneState::Idle;
    }

    /// Service one inbound datagram if present, otherwise advance timers.
    pub fn poll(&mut self) {
        let msg = match self.sip_receive() {
            Some(msg) => msg,
            None => {
                self.service_timers();
                return;
            }
        };

        if let StartLine::Request { method, .. } = &msg.start {
            if !method.is_compatible() {
                warn!("SIP method {} not compatible", method);
                return;
            }
        }

        if msg.headers.call_id == self.registration.call_id {
            self.handle_register_response(&msg);
            return;
        }
        if self.state == PhoneState::Inactive {
            return; // not registered yet
        }

        let in_dialog = self
            .dialog
            .as_ref()
            .map(|d| d.call_id == msg.headers.call_id)
            .unwrap_or(false);
        if in_dialog {
            // Got traffic for the pending transaction
            if let Some(d) = self.dialog.as_mut() {
                d.response_timer = None;
                if !msg.headers.record_route.is_empty() {
                    d.route_set = msg.headers.record_route.clone();
                }
                if let Some(contact) = &msg.headers.contact {
                    d.other_contact = contact_address(contact);
                }
                if let Some(sdp) = msg.sdp() {
                    d.remote_sdp = Some(sdp.clone());
                }
            }
        }

        if msg.is_request() {
            self.handle_request(msg, in_dialog);
        } else {
            self.handle_response(msg, in_dialog);
        }
    }

    fn service_timers(&mut self) {
        let now = Instant::now();

        if let Some(timer) = self.registration.timer {
            if now > timer {
                self.registration.timer = None;
                error!("Register timeout occurred");
                self.inactivate();
                return;
            }
        }
        if let Some(refresh) = self.registration.refresh_at {
            if now > refresh {
                self.registration.refresh_at = None;
                self.register(self.config.register_expires);
            }
        }

        let (response_due, answer_due) = match self.dialog.as_ref() {
            Some(d) => (
                d.response_timer.map(|t| now > t).unwrap_or(false),
                d.answer_timer.map(|t| now > t).unwrap_or(false),
            ),
            None => (false, false),
        };
        if response_due {
            warn!("Response timeout in state {:?}", self.state);
            if let Some(d) = self.dialog.as_mut() {
                d.response_timer = None;
            }
            match self.state {
                // Waiting on a teardown answer that never came: give up.
                PhoneState::HangingUp | PhoneState::Canceling | PhoneState::Deleting => {
                    self.delete_call()
                }
                _ => self.hangup(),
            }
        } else if answer_due {
            warn!("Answer timeout in state {:?}", self.state);
            if let Some(d) = self.dialog.as_mut() {
                d.answer_timer = None;
            }
            self.hangup();
        }
    }

    fn handle_register_response(&mut self, msg: &SipMessage) {
        self.registration.timer = None;
        if let Some(tag) = &msg.headers.to.tag {
            self.registration.other_tag = tag.clone();
        }
        match msg.status() {
            Some(SS_OK) => {
                if self.registration.expires != 0 {
                    if self.state == PhoneState::Registering {
                        // only when registering, never while refreshing mid-call
                        self.state = PhoneState::Idle;
                    }
                    let lead = self.config.register_expires.saturating_sub(5);
                    self.registration.refresh_at =
                        Some(Instant::now() + std::time::Duration::from_secs(lead as u64));
                    info!(
                        "Registered with {} as {}",
                        self.config.sip_domain, self.config.sip_user
                    );
                } else {
                    info!("Deregistered");
                    self.inactivate();
                }
            }
            Some(SS_UNAUTHORIZED) => {
                if self.registration.counter < self.registration.retry_limit {
                    if let Some(challenge) = msg.challenge() {
                        match self.registration.auth.as_mut() {
                            Some(auth) => auth.challenge = challenge.clone(),
                            None => {
                                self.registration.auth =
                                    Some(AuthState::new(challenge.clone(), SS_UNAUTHORIZED))
                            }
                        }
                    }
                    self.registration.timer = Some(Instant::now() + self.config.response_timeout);
                    let req = self.build_register();
                    self.sip_send(&req);
                } else {
                    error!(
                        "Register unauthorized, invalid credentials for {}",
                        self.uri
                    );
                    self.inactivate();
                }
            }
            Some(SS_FORBIDDEN) => {
                error!("Register forbidden, check credentials and server address");
                self.inactivate();
            }
            Some(SS_TRANSACTION_DOES_NOT_EXIST) => {
                error!("Register rejected with 481 Call/Transaction Does Not Exist");
                self.inactivate();
            }
            other => {
                warn!("Unhandled REGISTER response: {:?}", other);
            }
        }
    }

    fn handle_request(&mut self, msg: SipMessage, in_dialog: bool) {
        match msg.method() {
            Some(Method::Invite) => self.handle_invite(msg, in_dialog),
            Some(Method::Bye) => {
                let resp = self.build_response(&msg, SS_OK, false);
                self.sip_send(&resp);
                if in_dialog && self.state == PhoneState::Connected {
                    info!("Peer ended the call");
                    self.delete_call();
                }
            }
            Some(Method::Cancel) => {
                let ok = self.build_response(&msg, SS_OK, false); // answers the CANCEL
                self.sip_send(&ok);
                let terminated = self.build_response(&msg, SS_REQUEST_TERMINATED, false); // ends the INVITE
                self.sip_send(&terminated);
                if in_dialog && self.state == PhoneState::Ringing {
                    self.state = PhoneState::Canceling; // await the ACK
                }
            }
            Some(Method::Ack) => {
                if in_dialog {
                    match self.state {
                        PhoneState::Ringing => {
                            info!("Incoming call established");
                            self.rtp_start();
                            self.preload_dial_digits();
                            self.state = PhoneState::Connected;
                        }
                        PhoneState::Canceling => self.delete_call(),
                        _ => {}
                    }
                }
            }
            _ => warn!("Unhandled SIP request in state {:?}", self.state),
        }
    }

    fn handle_invite(&mut self, msg: SipMessage, in_dialog: bool) {
        if self.state == PhoneState::Idle && self.dialog.is_none() {
            let mut dialog = Dialog {
                call_id: msg.headers.call_id.clone(),
                my_tag: generate_tag(),
                other_user: msg.headers.from.address.clone(),
                other_contact: msg
                    .headers
                    .contact
                    .as_deref()
                    .map(contact_address)
                    .unwrap_or_else(|| msg.headers.from.address.clone()),
                other_tag: msg.headers.from.tag.clone().unwrap_or_default(),
                rtp_local_port: rand::thread_rng()
                    .gen_range(self.config.rtp_low..=self.config.rtp_high),
                event_pt: PT_EVENT,
                route_set: msg.headers.record_route.clone(),
                remote_sdp: msg.sdp().cloned(),
                ..Dialog::default()
            };
            if self.config.ip_phone_cid_is_number {
                // Callee's display doubles as the number to dial out
                dialog.ip_cid = msg.headers.to.cid.clone();
            }
            dialog.invite = Some(msg.clone());
            self.dialog = Some(dialog);
            self.state = PhoneState::Ringing;
            let resp = self.build_response(&msg, SS_RINGING, false);
            self.sip_send(&resp);
        } else if in_dialog && self.state == PhoneState::Connected {
            // Re-INVITE: renegotiate media and answer again
            debug!("Re-negotiation detected");
            if let Some(d) = self.dialog.as_mut() {
                if let Some(tag) = &msg.headers.to.tag {
                    d.my_tag = tag.clone();
                }
                if let Some(tag) = &msg.headers.from.tag {
                    d.other_tag = tag.clone();
                }
                d.other_user = msg.headers.from.address.clone();
                d.invite = Some(msg.clone());
            }
            if self.negotiate_media() {
                self.rtp_start();
                let resp = self.build_response(&msg, SS_OK, true);
                self.sip_send(&resp);
            } else {
                let resp = self.build_response(&msg, SS_NOT_ACCEPTABLE_HERE, false);
                self.sip_send(&resp);
            }
        } else {
            // One dialog at a time
            let resp = self.build_response(&msg, SS_BUSY_HERE, false);
            self.sip_send(&resp);
        }
    }

    fn handle_response(&mut self, msg: SipMessage, in_dialog: bool) {
        let status = match msg.status() {
            Some(status) => status,
            None => return,
        };
        if !in_dialog {
            warn!("Response {} for unknown call", status);
            return;
        }
        if let Some(d) = self.dialog.as_mut() {
            if let Some(tag) = &msg.headers.to.tag {
                d.other_tag = tag.clone();
            }
        }

        match status {
            SS_OK => match self.state {
                PhoneState::Dialing => {
                    info!("Outgoing call established");
                    if let Some(d) = self.dialog.as_mut() {
                        d.answer_timer = None;
                    }
                    if self.negotiate_media() {
                        let ack = self.build_request(Method::Ack, true);
                        self.sip_send(&ack);
                        self.rtp_start();
                        self.state = PhoneState::Connected;
                    } else {
                        error!("No compatible codec in answer, dropping call");
                        let ack = self.build_request(Method::Ack, true);
                        self.sip_send(&ack);
                        self.state = PhoneState::Connected;
                        self.hangup();
                    }
                }
                PhoneState::HangingUp => self.delete_call(),
                PhoneState::Canceling => {
                    // 200 for the CANCEL; the 487 for the INVITE is still due
                    if let Some(d) = self.dialog.as_mut() {
                        d.response_timer =
                            Some(Instant::now() + self.config.response_timeout);
                    }
                    self.state = PhoneState::Deleting;
                }
                PhoneState::Deleting => self.delete_call(),
                _ => {}
            },
            SS_UNAUTHORIZED | SS_FORBIDDEN | SS_PROXY_AUTH_REQUIRED => {
                if self.state == PhoneState::Dialing {
                    let retry_ok = self
                        .dialog
                        .as_ref()
                        .map(|d| self.request_counter < d.retry_limit)
                        .unwrap_or(false);
                    if retry_ok && msg.challenge().is_some() && status != SS_FORBIDDEN {
                        if let (Some(d), Some(challenge)) =
                            (self.dialog.as_mut(), msg.challenge())
                        {
                            match d.auth.as_mut() {
                                Some(auth) => {
                                    auth.challenge = challenge.clone();
                                    auth.cause = status;
                                }
                                None => d.auth = Some(AuthState::new(challenge.clone(), status)),
                            }
                        }
                        if status == SS_PROXY_AUTH_REQUIRED {
                            let ack = self.build_request(Method::Ack, false);
                            self.sip_send(&ack);
                        }
                        if let Some(d) = self.dialog.as_mut() {
                            d.response_timer =
                                Some(Instant::now() + self.config.response_timeout);
                        }
                        let req = self.build_request(Method::Invite, false);
                        self.sip_send(&req);
                    } else {
                        error!("Call unauthorized, invalid credentials for {}", self.uri);
                        let ack = self.build_request(Method::Ack, false);
                        self.sip_send(&ack);
                        self.delete_call();
                    }
                }
            }
            SS_TRYING | SS_PUSH_SENT | SS_RINGING => {}
            SS_TEMPORARILY_UNAVAILABLE | SS_BUSY_HERE | SS_DECLINE | SS_NOT_FOUND => {
                info!("Call refused with {} {}", status, reason_phrase(status));
                let ack = self.build_request(Method::Ack, false);
                self.sip_send(&ack);
                self.delete_call();
            }
            SS_REQUEST_TERMINATED => match self.state {
                PhoneState::Canceling => {
                    let ack = self.build_request(Method::Ack, false);
                    self.sip_send(&ack);
                    if let Some(d) = self.dialog.as_mut() {
                        d.response_timer =
                            Some(Instant::now() + self.config.response_timeout);
                    }
                    self.state = PhoneState::Deleting;
                }
                PhoneState::Deleting => {
                    let ack = self.build_request(Method::Ack, false);
                    self.sip_send(&ack);
                    self.delete_call();
                }
                _ => {}
            },
            SS_TRANSACTION_DOES_NOT_EXIST => self.delete_call(),
            SS_BAD_REQUEST => {
                error!("Peer rejected our request as malformed");
                self.delete_call();
            }
            SS_SERVICE_UNAVAILABLE => {
                error!("VoIP service unavailable");
                self.delete_call();
            }
            other => warn!("Unhandled SIP response {} in state {:?}", other, self.state),
        }
    }

    // --- media ---------------------------------------------------------

    /// Pick the codec and remote endpoint from the stored remote SDP.
    /// The first payload type of the offer that we also support wins.
    fn negotiate_media(&mut self) -> bool {
        let d = match self.dialog.as_mut() {
            Some(d) => d,
            None => return false,
        };
        let sdp = match &d.remote_sdp {
            Some(sdp) => sdp,
            None => {
                error!("No SDP from peer, cannot set up RTP");
                return false;
            }
        };
        let codec = sdp
            .payload_types
            .iter()
            .find(|pt| PREFERRED_AUDIO.contains(pt))
            .and_then(|&pt| G711Codec::from_payload_type(pt));
        let codec = match codec {
            Some(codec) => codec,
            None => {
                error!("No compatible codec for call (offered {:?})", sdp.payload_types);
                return false;
            }
        };
        debug!("{} negotiated for RTP session", codec.name());

        let remote_ip = sdp.connection.as_deref().and_then(|a| a.parse().ok());
        let remote_ip: IpAddr = match remote_ip {
            Some(ip) => ip,
            None => {
                error!("No usable connection address in SDP");
                return false;
            }
        };
        d.codec = Some(codec);
        d.event_pt = sdp.telephone_event_pt().unwrap_or(PT_EVENT);
        d.remote_rtp = Some(SocketAddr::new(remote_ip, sdp.media_port));
        true
    }

    fn rtp_start(&mut self) {
        self.rtp_stop();
        let d = match self.dialog.as_ref() {
            Some(d) => d,
            None => return,
        };
        let (codec, remote) = match (d.codec, d.remote_rtp) {
            (Some(codec), Some(remote)) => (codec, remote),
            _ => {
                error!("RTP start without negotiated media");
                return;
            }
        };
        match RtpSession::bind(self.local_ip, d.rtp_local_port, remote, codec, d.event_pt) {
            Ok(session) => self.rtp = Some(session),
            Err(e) => error!("Failed to start RTP: {}", e),
        }
    }

    fn rtp_stop(&mut self) {
        self.rtp = None;
    }

    /// Queue the callee caller-id as DTMF when it is purely dialable.
    fn preload_dial_digits(&mut self) {
        if !self.config.ip_phone_cid_is_number {
            return;
        }
        let digits = match self.dialog.as_ref() {
            Some(d) if !d.ip_cid.is_empty() => d.ip_cid.clone(),
            _ => return,
        };
        if digits.chars().all(|c| DTMF_DIGITS.contains(c)) {
            if let Some(rtp) = self.rtp.as_mut() {
                rtp.queue_dtmf(&digits);
            }
        }
    }

    /// Pull one RTP payload as unsigned 8-bit PCM.
    pub fn read_audio(&mut self) -> Option<Vec<u8>> {
        self.rtp.as_mut()?.read_audio()
    }

    /// Push one frame of unsigned 8-bit PCM toward the peer.
    pub fn write_audio(&mut self, frame: &[u8]) {
        if let Some(rtp) = self.rtp.as_mut() {
            rtp.write_audio(frame);
        }
    }

    pub fn read_dtmf(&mut self) -> Option<char> {
        self.rtp.as_mut()?.read_dtmf()
    }

    pub fn send_dtmf(&mut self, digit: char) {
        if let Some(rtp) = self.rtp.as_mut() {
            rtp.send_dtmf(digit);
        }
    }

    // --- wire ----------------------------------------------------------

    fn sip_receive(&mut self) -> Option<SipMessage> {
        let socket = self.socket.as_ref()?;
        let mut buf = [0u8; SIP_BUF_SIZE];
        let (len, sender) = match socket.try_recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                trace!("SIP receive error: {}", e);
                return None;
            }
        };
        trace!(
            "SIP received from {}:\n{}",
            sender,
            String::from_utf8_lossy(&buf[..len])
        );
        match SipMessage::parse(&buf[..len]) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Undecipherable SIP datagram from {}: {}", sender, e);
                None
            }
        }
    }

    fn sip_send(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let (socket, addr) = match (self.socket.as_ref(), self.send_addr) {
            (Some(socket), Some(addr)) => (socket, addr),
            _ => {
                warn!("SIP send while not active");
                return;
            }
        };
        trace!("SIP send to {}:\n{}", addr, text);
        if let Err(e) = socket.try_send_to(text.as_bytes(), addr) {
            warn!("SIP send failed: {}", e);
        }
    }

    // --- message builders ----------------------------------------------

    fn build_register(&mut self) -> String {
        let branch = generate_branch();
        self.registration.my_tag = generate_tag();
        self.registration.other_tag.clear();
        self.registration.counter += 1;

        let mut req = format!("REGISTER sip:{} SIP/2.0\r\n", self.config.sip_domain);
        req += &format!(
            "Via: SIP/2.0/UDP {}:{};branch={}\r\n",
            self.local_ip, self.local_port, branch
        );
        req += &format!("From: <{}>;tag={}\r\n", self.uri, self.registration.my_tag);
        req += &format!("To: <{}>\r\n", self.uri);
        req += &format!("CSeq: {} REGISTER\r\n", self.registration.counter);
        req += &format!("Call-ID: {}\r\n", self.registration.call_id);
        req += "Max-Forwards: 70\r\n";
        req += &self.contact_header();
        req += &format!("Expires: {}\r\n", self.registration.expires);
        req += &format!("User-Agent: pstnlink/{}\r\n", env!("CARGO_PKG_VERSION"));
        if let Some(auth) = self.registration.auth.as_mut() {
            let value = auth.authorization(
                &self.config.sip_user,
                &self.config.sip_pass,
                "REGISTER",
                &self.uri,
            );
            req += &format!("{}: {}\r\n", auth.header_name(), value);
        }
        req += &allow_header();
        req += "Content-Length: 0\r\n\r\n";
        req
    }

    /// Build an in-dialog request. `fresh_branch_ack` distinguishes the
    /// ACK for a 2xx (own transaction, fresh branch) from the ACK that
    /// closes a failed INVITE transaction (reuses the INVITE branch).
    fn build_request(&mut self, method: Method, fresh_branch_ack: bool) -> String {
        if self.dialog.is_none() {
            return String::new();
        }
        if matches!(method, Method::Invite | Method::Bye) {
            self.request_counter += 1;
            if let Some(d) = self.dialog.as_mut() {
                d.branch = generate_branch();
            }
        }
        if matches!(method, Method::Invite | Method::Cancel) {
            // No remote tag on an initial INVITE or its CANCEL
            if let Some(d) = self.dialog.as_mut() {
                d.other_tag.clear();
            }
        }

        let contact = self.contact_header();
        let auth_line = if method == Method::Invite {
            let user = self.config.sip_user.clone();
            let pass = self.config.sip_pass.clone();
            let uri = self.uri.clone();
            match self.dialog.as_mut().and_then(|d| d.auth.as_mut()) {
                Some(auth) => {
                    let value = auth.authorization(&user, &pass, "INVITE", &uri);
                    format!("{}: {}\r\n", auth.header_name(), value)
                }
                None => String::new(),
            }
        } else {
            String::new()
        };

        let d = match self.dialog.as_ref() {
            Some(d) => d,
            None => return String::new(),
        };
        let body = if method == Method::Invite {
            build_sdp_body(
                &self.local_ip.to_string(),
                d.rtp_local_port,
                d.codec,
                d.event_pt,
            )
        } else {
            String::new()
        };
        let branch = if fresh_branch_ack { generate_branch() } else { d.branch.clone() };

        let mut req = format!("{} sip:{} SIP/2.0\r\n", method, d.other_contact);
        req += &format!(
            "Via: SIP/2.0/UDP {}:{};branch={}\r\n",
            self.local_ip, self.local_port, branch
        );
        // Record-Route of the newest dialog message, reversed, becomes the Route
        for route in d.route_set.iter().rev() {
            req += &format!("Route: {}\r\n", route);
        }
        req += "Max-Forwards: 70\r\n";
        req += "From: ";
        if !d.line_cid.is_empty() {
            req += &format!("\"{}\" ", d.line_cid);
        }
        req += &format!("<{}>;tag={}\r\n", self.uri, d.my_tag);
        req += &format!("To: <sip:{}>", d.other_user);
        if !d.other_tag.is_empty() {
            req += &format!(";tag={}", d.other_tag);
        }
        req += "\r\n";
        req += &format!("Call-ID: {}\r\n", d.call_id);
        req += &format!("CSeq: {} {}\r\n", self.request_counter, method);
        if method == Method::Invite {
            req += &contact;
            req += &auth_line;
            req += &allow_header();
        }
        if body.is_empty() {
            req += "Content-Length: 0\r\n\r\n";
        } else {
            req += "Content-Type: application/sdp\r\n";
            req += &format!("Content-Length: {}\r\n\r\n", body.len());
            req += &body;
        }
        req
    }

    /// Build a response to `msg`, echoing its Via stack and Record-Route
    /// verbatim and in order.
    fn build_response(&self, msg: &SipMessage, status: u16, with_sdp: bool) -> String {
        let cseq_is_invite = msg
            .headers
            .cseq
            .as_ref()
            .map(|c| c.method == "INVITE")
            .unwrap_or(false);
        let body = if with_sdp && status == SS_OK && cseq_is_invite {
            let d = self.dialog.as_ref();
            build_sdp_body(
                &self.local_ip.to_string(),
                d.map(|d| d.rtp_local_port).unwrap_or(0),
                d.and_then(|d| d.codec),
                d.map(|d| d.event_pt).unwrap_or(PT_EVENT),
            )
        } else {
            String::new()
        };

        let mut resp = format!("SIP/2.0 {} {}\r\n", status, reason_phrase(status));
        for via in &msg.headers.via {
            resp += &format!("Via: {}\r\n", via.raw);
        }
        for rr in &msg.headers.record_route {
            resp += &format!("Record-Route: {}\r\n", rr);
        }
        resp += &format!(
            "Max-Forwards: {}\r\n",
            msg.headers.max_forwards.unwrap_or(70)
        );
        resp += &format!("From: {}", msg.headers.from.raw);
        if let Some(tag) = &msg.headers.from.tag {
            resp += &format!(";tag={}", tag);
        }
        resp += "\r\n";
        if !body.is_empty() {
            resp += &self.contact_header();
        }
        resp += &format!("To: {}", msg.headers.to.raw);
        let our_dialog = self
            .dialog
            .as_ref()
            .filter(|d| d.call_id == msg.headers.call_id);
        match our_dialog {
            Some(d) => resp += &format!(";tag={}\r\n", d.my_tag),
            None => {
                if let Some(tag) = &msg.headers.to.tag {
                    resp += &format!(";tag={}\r\n", tag);
                } else {
                    resp += "\r\n";
                }
            }
        }
        resp += &format!("Call-ID: {}\r\n", msg.headers.call_id);
        if let Some(cseq) = &msg.headers.cseq {
            // A 487 answers the INVITE even when triggered by a CANCEL
            let method = if status == SS_REQUEST_TERMINATED {
                "INVITE"
            } else {
                cseq.method.as_str()
            };
            resp += &format!("CSeq: {} {}\r\n", cseq.seq, method);
        }
        resp += &allow_header();
        if body.is_empty() {
            resp += "Content-Length: 0\r\n\r\n";
        } else {
            resp += "Content-Type: application/sdp\r\n";
            resp += &format!("Content-Length: {}\r\n\r\n", body.len());
            resp += &body;
        }
        resp
    }

    fn contact_header(&self) -> String {
        format!(
            "Contact: <sip:{}@{}:{}>;+sip.instance=\"<urn:uuid:{}>\"\r\n",
            self.config.sip_user, self.local_ip, self.local_port, self.instance_uuid
        )
    }
}

fn allow_header() -> String {
    "Allow: INVITE, ACK, BYE, CANCEL\r\n".to_string()
}

/// SDP body for offers and answers. An offer advertises our preferred
/// codec (PCMU) plus telephone-event; an answer repeats the negotiated
/// codec.
fn build_sdp_body(local_ip: &str, rtp_port: u16, codec: Option<G711Codec>, event_pt: u8) -> String {
    let audio_pt = codec.map(|c| c.payload_type()).unwrap_or(PT_PCMU);
    let audio_name = codec.map(|c| c.name()).unwrap_or("PCMU");
    let mut rng = rand::thread_rng();

    let mut body = String::from("v=0\r\n");
    body += &format!(
        "o=pstnlink {} {} IN IP4 {}\r\n",
        rng.gen_range(1..100000u32),
        rng.gen_range(1..100000u32),
        local_ip
    );
    body += "s=pstnlink\r\n";
    body += &format!("c=IN IP4 {}\r\n", local_ip);
    body += "t=0 0\r\n";
    body += &format!("m=audio {} RTP/AVP {} {}\r\n", rtp_port, audio_pt, event_pt);
    body += &format!("a=rtpmap:{} {}/8000\r\n", audio_pt, audio_name);
    body += &format!("a=rtpmap:{} telephone-event/8000\r\n", event_pt);
    body += &format!("a=fmtp:{} 0-15\r\n", event_pt);
    body += "a=maxptime:150\r\n";
    body += "a=sendrecv\r\n";
    body
}

/// Contact header to request target: the URI between `sip:` and `>`.
/// Without angle brackets the raw remainder is used as-is.
fn contact_address(value: &str) -> String {
    match value.split_once("sip:") {
        Some((_, rest)) => match rest.split_once('>') {
            Some((addr, _)) => addr.to_string(),
            None => rest.trim().to_string(),
        },
        None => value.trim().to_string(),
    }
}

/// Generate a random 32-hex Call-ID
pub fn generate_call_id() -> String {
    let a: u64 = rand::thread_rng().gen();
    let b: u64 = rand::thread_rng().gen();
    format!("{:016x}{:016x}", a, b)
}

/// Generate a random 8-hex tag for From/To headers
pub fn generate_tag() -> String {
    let random: u32 = rand::thread_rng().gen();
    format!("{:08x}", random)
}

/// Generate a Via branch parameter, prefixed with the z9hG4bK magic
/// cookie RFC 3261 requires.
pub fn generate_branch() -> String {
    let a: u64 = rand::thread_rng().gen();
    let b: u32 = rand::thread_rng().gen();
    format!("z9hG4bK{:016x}{:08x}", a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::{Body, SS_OK};
    use std::collections::HashMap;

    fn test_config() -> Arc<Config> {
        let map = HashMap::from([
            ("IP_PBX_USER", "1001"),
            ("IP_PBX_DOMAIN", "pbx.example.com"),
            ("IP_PBX_PASS", "secret"),
            ("IP_PHONE_IP", "127.0.0.1"),
            ("IP_PHONE_PORT", "0"),
            ("CALL_FORWARD_TO", "1000@pbx.example.com"),
        ]);
        Arc::new(Config::from_map(&map).unwrap())
    }

    #[test]
    fn test_branch_has_magic_cookie_and_entropy() {
        let branch = generate_branch();
        assert!(branch.starts_with("z9hG4bK"));
        assert!(branch.len() > "z9hG4bK".len());
        assert_ne!(branch, generate_branch());
    }

    #[test]
    fn test_tag_is_eight_hex_digits() {
        for _ in 0..5 {
            let tag = generate_tag();
            assert_eq!(tag.len(), 8);
            assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_generate_call_id_unique() {
        assert_ne!(generate_call_id(), generate_call_id());
    }

    #[test]
    fn test_register_roundtrips_through_parser() {
        let mut phone = IpPhone::new(test_config());
        phone.registration.call_id = generate_call_id();
        phone.registration.expires = 60;
        let req = phone.build_register();

        let msg = SipMessage::parse(req.as_bytes()).unwrap();
        assert_eq!(msg.method(), Some(Method::Register));
        assert_eq!(msg.headers.call_id, phone.registration.call_id);
        let cseq = msg.headers.cseq.as_ref().unwrap();
        assert_eq!(cseq.seq, phone.registration.counter);
        assert_eq!(cseq.method, "REGISTER");
        assert_eq!(
            msg.headers.from.tag.as_deref(),
            Some(phone.registration.my_tag.as_str())
        );
        assert_eq!(msg.headers.expires, Some(60));
        assert!(msg.headers.via[0]
            .branch
            .as_deref()
            .unwrap()
            .starts_with("z9hG4bK"));
        assert!(msg
            .headers
            .contact
            .as_deref()
            .unwrap()
            .contains("+sip.instance=\"<urn:uuid:"));
    }

    #[test]
    fn test_register_cseq_monotonic() {
        let mut phone = IpPhone::new(test_config());
        phone.registration.call_id = generate_call_id();
        let first = phone.build_register();
        let second = phone.build_register();
        let seq = |req: &str| {
            SipMessage::parse(req.as_bytes())
                .unwrap()
                .headers
                .cseq
                .unwrap()
                .seq
        };
        assert_eq!(seq(&second), seq(&first) + 1);
    }

    #[test]
    fn test_invite_offer_lists_pcmu_and_event() {
        let mut phone = IpPhone::new(test_config());
        phone.dialog = Some(Dialog {
            call_id: "c1".into(),
            my_tag: "mt".into(),
            other_contact: "bob@ex".into(),
            other_user: "bob@ex".into(),
            rtp_local_port: 10400,
            event_pt: PT_EVENT,
            ..Dialog::default()
        });
        let req = phone.build_request(Method::Invite, false);
        let msg = SipMessage::parse(req.as_bytes()).unwrap();
        assert_eq!(msg.method(), Some(Method::Invite));
        let sdp = msg.sdp().unwrap();
        assert_eq!(sdp.payload_types, vec![0, 101]);
        assert_eq!(sdp.media_port, 10400);
        assert!(req.contains("a=fmtp:101 0-15"));
        assert!(req.contains("a=maxptime:150"));
        assert!(req.contains("a=sendrecv"));
    }

    #[test]
    fn test_cancel_reuses_invite_cseq_and_branch() {
        let mut phone = IpPhone::new(test_config());
        phone.dialog = Some(Dialog {
            call_id: "c1".into(),
            my_tag: "mt".into(),
            other_contact: "bob@ex".into(),
            other_user: "bob@ex".into(),
            ..Dialog::default()
        });
        let invite = phone.build_request(Method::Invite, false);
        let cancel = phone.build_request(Method::Cancel, false);

        let parse = |req: &str| SipMessage::parse(req.as_bytes()).unwrap();
        let invite = parse(&invite);
        let cancel = parse(&cancel);
        assert_eq!(
            invite.headers.cseq.as_ref().unwrap().seq,
            cancel.headers.cseq.as_ref().unwrap().seq
        );
        assert_eq!(invite.headers.via[0].branch, cancel.headers.via[0].branch);
        assert_eq!(cancel.headers.to.tag, None, "CANCEL carries no To tag");
    }

    #[test]
    fn test_bye_increments_cseq_with_fresh_branch() {
        let mut phone = IpPhone::new(test_config());
        phone.dialog = Some(Dialog {
            call_id: "c1".into(),
            my_tag: "mt".into(),
            other_tag: "ot".into(),
            other_contact: "bob@ex".into(),
            other_user: "bob@ex".into(),
            ..Dialog::default()
        });
        let invite = phone.build_request(Method::Invite, false);
        let bye = phone.build_request(Method::Bye, false);

        let parse = |req: &str| SipMessage::parse(req.as_bytes()).unwrap();
        let invite = parse(&invite);
        let bye = parse(&bye);
        assert_eq!(
            bye.headers.cseq.as_ref().unwrap().seq,
            invite.headers.cseq.as_ref().unwrap().seq + 1
        );
        assert_ne!(invite.headers.via[0].branch, bye.headers.via[0].branch);
    }

    #[test]
    fn test_route_set_reversed_into_route_headers() {
        let mut phone = IpPhone::new(test_config());
        phone.dialog = Some(Dialog {
            call_id: "c1".into(),
            my_tag: "mt".into(),
            other_tag: "ot".into(),
            other_contact: "bob@ex".into(),
            other_user: "bob@ex".into(),
            route_set: vec!["<sip:p1;lr>".into(), "<sip:p2;lr>".into()],
            ..Dialog::default()
        });
        let bye = phone.build_request(Method::Bye, false);
        let p1 = bye.find("Route: <sip:p1;lr>").unwrap();
        let p2 = bye.find("Route: <sip:p2;lr>").unwrap();
        assert!(p2 < p1, "Route must reverse the Record-Route order");
    }

    #[test]
    fn test_response_echoes_via_stack_in_order() {
        let request = b"INVITE sip:1001@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP first.example:5060;branch=z9hG4bK1;rport\r\n\
            Via: SIP/2.0/UDP second.example:5061;branch=z9hG4bK2;received=1.2.3.4\r\n\
            Record-Route: <sip:rr1;lr>\r\n\
            Record-Route: <sip:rr2;lr>\r\n\
            From: \"A\" <sip:a@h>;tag=ft\r\n\
            To: <sip:1001@h>\r\n\
            Call-ID: cid-via\r\n\
            CSeq: 7 INVITE\r\n\
            \r\n";
        let msg = SipMessage::parse(request).unwrap();
        let phone = IpPhone::new(test_config());
        let resp = phone.build_response(&msg, SS_RINGING, false);

        let v1 = resp
            .find("Via: SIP/2.0/UDP first.example:5060;branch=z9hG4bK1;rport")
            .unwrap();
        let v2 = resp
            .find("Via: SIP/2.0/UDP second.example:5061;branch=z9hG4bK2;received=1.2.3.4")
            .unwrap();
        assert!(v1 < v2, "Via echo must preserve inbound order");
        let r1 = resp.find("Record-Route: <sip:rr1;lr>").unwrap();
        let r2 = resp.find("Record-Route: <sip:rr2;lr>").unwrap();
        assert!(r1 < r2);
        assert!(resp.contains("CSeq: 7 INVITE"));
        assert!(resp.contains("From: \"A\" <sip:a@h>;tag=ft"));
    }

    #[test]
    fn test_487_response_names_invite_in_cseq() {
        let cancel = b"CANCEL sip:1001@h SIP/2.0\r\n\
            Via: SIP/2.0/UDP a:5060;branch=z9hG4bK1\r\n\
            From: <sip:a@h>;tag=ft\r\n\
            To: <sip:1001@h>\r\n\
            Call-ID: cid-cancel\r\n\
            CSeq: 3 CANCEL\r\n\
            \r\n";
        let msg = SipMessage::parse(cancel).unwrap();
        let phone = IpPhone::new(test_config());
        let ok = phone.build_response(&msg, SS_OK, false);
        assert!(ok.contains("CSeq: 3 CANCEL"));
        let terminated = phone.build_response(&msg, SS_REQUEST_TERMINATED, false);
        assert!(terminated.contains("CSeq: 3 INVITE"));
    }

    #[test]
    fn test_negotiate_prefers_offer_order() {
        let mut phone = IpPhone::new(test_config());
        phone.dialog = Some(Dialog {
            call_id: "c1".into(),
            remote_sdp: Sdp::parse("c=IN IP4 10.0.0.9\r\nm=audio 4000 RTP/AVP 8 0 101\r\na=rtpmap:101 telephone-event/8000\r\n"),
            ..Dialog::default()
        });
        assert!(phone.negotiate_media());
        let d = phone.dialog.as_ref().unwrap();
        assert_eq!(d.codec, Some(G711Codec::ALaw), "first offered wins");
        assert_eq!(d.event_pt, 101);
        assert_eq!(d.remote_rtp.unwrap().port(), 4000);
    }

    #[test]
    fn test_negotiate_fails_without_common_codec() {
        let mut phone = IpPhone::new(test_config());
        phone.dialog = Some(Dialog {
            call_id: "c1".into(),
            remote_sdp: Sdp::parse("c=IN IP4 10.0.0.9\r\nm=audio 4000 RTP/AVP 18\r\n"),
            ..Dialog::default()
        });
        assert!(!phone.negotiate_media());
    }

    #[test]
    fn test_contact_address_forms() {
        assert_eq!(
            contact_address("<sip:1000@10.0.0.1:5060>;+sip.instance=\"x\""),
            "1000@10.0.0.1:5060"
        );
        assert_eq!(contact_address("sip:1000@10.0.0.1"), "1000@10.0.0.1");
        assert_eq!(contact_address("weird-value"), "weird-value");
    }

    #[test]
    fn test_sdp_body_answer_repeats_negotiated_codec() {
        let body = build_sdp_body("10.0.0.5", 12000, Some(G711Codec::ALaw), 96);
        assert!(body.contains("m=audio 12000 RTP/AVP 8 96"));
        assert!(body.contains("a=rtpmap:8 PCMA/8000"));
        assert!(body.contains("a=rtpmap:96 telephone-event/8000"));
    }

    #[test]
    fn test_body_none_on_ack() {
        let mut phone = IpPhone::new(test_config());
        phone.dialog = Some(Dialog {
            call_id: "c1".into(),
            my_tag: "mt".into(),
            other_tag: "ot".into(),
            other_contact: "bob@ex".into(),
            other_user: "bob@ex".into(),
            ..Dialog::default()
        });
        let ack = phone.build_request(Method::Ack, true);
        let msg = SipMessage::parse(ack.as_bytes()).unwrap();
        assert_eq!(msg.body, Body::None);
        assert!(ack.contains("Content-Length: 0"));
    }
}
