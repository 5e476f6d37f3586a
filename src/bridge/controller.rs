/// Bridge controller
///
/// The 10 ms tick that couples the PSTN line and the SIP agent: answers
/// whichever side rings, routes audio frames and DTMF between the legs
/// while cross-connected, serves the dial/ringback prompts, enforces the
/// session, response and dial deadlines, and drives both subsystem polls.
/// All call state lives in this struct; the tick owns everything.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::prompt::{PromptPlayer, DIAL_PROMPT, RINGBACK_PROMPT};
use super::recorder::CallRecorder;
use crate::config::{Config, DTMF_DIGITS, LOOP_TIME};
use crate::line::{Line, LineState};
use crate::sip::{IpPhone, PhoneState};

/// Which leg initiated the active call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    FromIp,
    FromPstn,
}

pub struct Bridge {
    config: Arc<Config>,
    phone: IpPhone,
    line: Line,
    cross_connected: bool,
    call_from: Option<CallOrigin>,
    session_timer: Option<Instant>,
    resp_timer: Option<Instant>,
    dial_timer: Option<Instant>,
    /// PSTN-side party: caller ID in, dialed digits out
    line_number: String,
    /// IP-side party: dialed user or the forward target
    ip_number: String,
    prompt: PromptPlayer,
    recorder: Option<CallRecorder>,
}

impl Bridge {
    pub fn new(config: Arc<Config>, phone: IpPhone, line: Line) -> Self {
        Self {
            config,
            phone,
            line,
            cross_connected: false,
            call_from: None,
            session_timer: None,
            resp_timer: None,
            dial_timer: None,
            line_number: String::new(),
            ip_number: String::new(),
            prompt: PromptPlayer::new(),
            recorder: None,
        }
    }

    pub fn is_cross_connected(&self) -> bool {
        self.cross_connected
    }

    pub fn call_from(&self) -> Option<CallOrigin> {
        self.call_from
    }

    pub fn phone(&self) -> &IpPhone {
        &self.phone
    }

    pub fn line(&self) -> &Line {
        &self.line
    }

    pub fn prompt_active(&self) -> bool {
        self.prompt.is_playing()
    }

    /// Bring both legs up: modem into data mode, SIP agent registering.
    pub fn start(&mut self) -> Result<()> {
        self.line.start().context("line startup failed")?;
        self.phone.start().context("SIP agent startup failed")?;
        Ok(())
    }

    /// Bring both legs up and run the tick loop until cancelled or the
    /// registration is lost.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.start()?;

        // Let the registration settle before bridging anything.
        while self.phone.state() == PhoneState::Registering {
            self.phone.poll();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        if self.phone.state() == PhoneState::Inactive {
            self.line.stop();
            bail!("SIP registration failed");
        }
        info!("Bridge running");

        let mut interval = tokio::time::interval(LOOP_TIME);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.phone.state() == PhoneState::Inactive {
                        // Registration lost after startup is fatal.
                        error!("SIP registrar dropped us, shutting down");
                        self.stop_cross_conn();
                        self.line.stop();
                        bail!("deregistered by the SIP server");
                    }
                    self.tick();
                }
            }
        }

        info!("Bridge shutting down");
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.stop_cross_conn();
        self.phone.stop();
        let deadline = Instant::now() + self.config.response_timeout;
        while self.phone.is_active() && Instant::now() < deadline {
            self.phone.poll();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.line.stop();
    }

    /// One bridge tick. Priority order: active cross-connect, then the
    /// in-progress call setup of either origin, then new ringing legs.
    /// The subsystem polls and the prompt pump always run afterwards.
    pub fn tick(&mut self) {
        if self.cross_connected {
            self.tick_cross_connected();
        } else if self.call_from == Some(CallOrigin::FromIp) {
            self.tick_from_ip();
        } else if self.call_from == Some(CallOrigin::FromPstn) {
            self.tick_from_pstn();
        } else if self.phone.state() == PhoneState::Ringing {
            debug!("Answering incoming IP call");
            self.resp_timer = Some(Instant::now() + self.config.response_timeout);
            self.call_from = Some(CallOrigin::FromIp);
            self.phone.answer();
        } else if self.line.state() == LineState::Ringing
            && self.line.ring_counter() >= self.config.answer_after_rings
        {
            debug!("Answering incoming line call");
            self.line_number = self.line.caller_id().to_string();
            self.call_from = Some(CallOrigin::FromPstn);
            self.line.start_voice_mode();
            if self.config.local_pbx && self.config.line_can_dial {
                self.ip_number.clear();
                self.dial_timer = Some(Instant::now() + self.config.dial_timeout);
                self.prompt.start(DIAL_PROMPT);
            } else {
                self.resp_timer = Some(Instant::now() + self.config.answer_timeout);
                self.prompt.start(RINGBACK_PROMPT);
                self.ip_number = self.config.call_forward_to.clone();
                let target = self.ip_number.clone();
                let cid = self.line_number.clone();
                self.phone.call(&cid, &target);
            }
        }

        self.line.poll();
        self.phone.poll();
        self.pump_prompt();
    }

    fn tick_cross_connected(&mut self) {
        let session_expired = self
            .session_timer
            .map(|t| Instant::now() > t)
            .unwrap_or(false);
        if session_expired {
            warn!("Session timeout, call will be disconnected");
            self.stop_cross_conn();
            return;
        }
        if self.phone.state() == PhoneState::Idle {
            debug!("IP phone closed the call");
            self.stop_cross_conn();
            return;
        }
        if self.line.state() != LineState::Connected {
            debug!("Line closed the call");
            self.stop_cross_conn();
            return;
        }

        if let Some(frame) = self.line.read_audio() {
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.write(&frame);
            }
            if self.line.echo_suppressed() {
                // damp the far echo: silence toward the SIP side
                self.phone.write_audio(&vec![0x80u8; frame.len()]);
            } else {
                self.phone.write_audio(&frame);
            }
        }
        if let Some(frame) = self.phone.read_audio() {
            self.line.write_audio(&frame);
        }

        if let Some(digit) = self.line.read_dtmf() {
            if DTMF_DIGITS.contains(digit) {
                self.phone.send_dtmf(digit);
            }
        }
        if let Some(digit) = self.phone.read_dtmf() {
            if DTMF_DIGITS.contains(digit) {
                self.line.send_dtmf(digit);
            }
        }
    }

    /// An IP phone called us: play the dial prompt, collect digits, then
    /// dial the line and cross-connect.
    fn tick_from_ip(&mut self) {
        let _ = self.phone.read_audio(); // keep the receive queues drained
        let _ = self.line.read_audio();

        if self.phone.state() == PhoneState::Idle {
            debug!("IP phone closed the call");
            self.stop_cross_conn();
            return;
        }
        if self.phone.state() == PhoneState::Connected {
            if self.dial_timer.is_none() {
                debug!("IP call connected, waiting for dialed digits");
                self.resp_timer = None;
                self.line_number.clear();
                self.dial_timer = Some(Instant::now() + self.config.dial_timeout);
                self.prompt.start(DIAL_PROMPT);
                return;
            }
            if self.dial_timer.map(|t| Instant::now() > t).unwrap_or(false) {
                warn!("IP phone did not dial a number, call will be disconnected");
                self.stop_cross_conn();
                return;
            }
            if let Some(digit) = self.phone.read_dtmf() {
                self.line_number.push(digit);
                // Dial plan: leading 0 dials 11-digit outside numbers,
                // leading * dials 3-digit internal numbers.
                let wanted = match self.line_number.chars().next() {
                    Some('0') => 11,
                    Some('*') => 3,
                    _ => {
                        warn!("IP phone dialed a wrong number, call will be disconnected");
                        self.stop_cross_conn();
                        return;
                    }
                };
                if self.line_number.len() == wanted {
                    let number = self.line_number.clone();
                    self.line.dial(&number);
                    self.start_cross_conn();
                    return;
                }
            }
        }
        if self.resp_timer.map(|t| Instant::now() > t).unwrap_or(false) {
            warn!("IP phone connect timeout, call will be disconnected");
            self.resp_timer = None;
            self.phone.hangup();
        }
    }

    /// The line called us: forward to the configured SIP target, or (on a
    /// local PBX that allows it) let the caller dial an extension.
    fn tick_from_pstn(&mut self) {
        let _ = self.phone.read_audio();
        let _ = self.line.read_audio();

        if self.line.state() != LineState::Connected {
            debug!("Line gave up");
            self.stop_cross_conn();
            return;
        }
        if self.phone.state() == PhoneState::Connected {
            debug!("IP phone answered, call connected");
            self.start_cross_conn();
            return;
        }
        if let Some(timer) = self.resp_timer {
            if Instant::now() > timer {
                debug!("Dialed IP phone, answer timeout");
                self.stop_cross_conn();
                return;
            }
            if self.phone.state() == PhoneState::Idle {
                debug!("IP phone rejected call or busy");
                self.stop_cross_conn();
                return;
            }
        }
        if let Some(timer) = self.dial_timer {
            if Instant::now() > timer {
                warn!("PSTN phone did not dial a number, call will be disconnected");
                self.stop_cross_conn();
                return;
            }
            if let Some(digit) = self.line.read_dtmf() {
                self.ip_number.push(digit);
                // Extensions start with 1 and have four digits.
                if self.ip_number.starts_with('1') {
                    if self.ip_number.len() == 4 && self.phone.state() == PhoneState::Idle {
                        let target = format!("{}@{}", self.ip_number, self.config.sip_domain);
                        debug!("Line dialed IP phone {}", target);
                        self.ip_number = target.clone();
                        self.dial_timer = None;
                        self.resp_timer = Some(Instant::now() + self.config.answer_timeout);
                        self.prompt.start(RINGBACK_PROMPT);
                        let cid = self.line_number.clone();
                        self.phone.call(&cid, &target);
                    }
                } else {
                    warn!("PSTN phone dialed a wrong number, call will be disconnected");
                    self.stop_cross_conn();
                }
            }
        }
    }

    fn start_cross_conn(&mut self) {
        if self.cross_connected {
            return;
        }
        debug!("start_cross_conn");
        self.prompt.stop();
        if self.config.recording_enabled {
            let (from, to) = match self.call_from {
                Some(CallOrigin::FromIp) => (self.ip_number.as_str(), self.line_number.as_str()),
                _ => (self.line_number.as_str(), self.ip_number.as_str()),
            };
            match CallRecorder::start(from, to) {
                Ok(recorder) => self.recorder = Some(recorder),
                Err(e) => warn!("Recording disabled for this call: {}", e),
            }
        }
        self.line.start_voice_mode();
        let _ = self.phone.read_audio(); // flush both receive queues
        let _ = self.line.read_audio();
        self.session_timer = Some(Instant::now() + self.config.max_session_duration);
        self.dial_timer = None;
        self.resp_timer = None;
        self.cross_connected = true;
    }

    fn stop_cross_conn(&mut self) {
        debug!("stop_cross_conn");
        self.line.stop_voice_mode();
        self.phone.hangup();
        self.prompt.stop();
        if let Some(recorder) = self.recorder.take() {
            recorder.finalize();
        }
        self.line_number.clear();
        self.ip_number.clear();
        self.session_timer = None;
        self.dial_timer = None;
        self.resp_timer = None;
        self.call_from = None;
        self.cross_connected = false;
    }

    /// Feed one chunk of the active prompt to the originating leg.
    fn pump_prompt(&mut self) {
        if !self.prompt.is_playing() {
            return;
        }
        if let Some(chunk) = self.prompt.next_chunk() {
            match self.call_from {
                Some(CallOrigin::FromPstn) => self.line.write_audio(&chunk),
                Some(CallOrigin::FromIp) => self.phone.write_audio(&chunk),
                None => {}
            }
        }
    }
}
