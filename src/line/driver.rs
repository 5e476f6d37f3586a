/// PSTN line driver
/// Reference: ITU-T V.250/V.253 voice-modem AT command set
///
/// Owns the modem serial link. Two logical modes: data (AT commands,
/// ring and caller-ID reports) and voice (raw 8 kHz unsigned PCM with
/// DLE-shielded control codes inline). AT command failures are logged
/// and never abort the process; everything in the voice path signals
/// through state transitions.

use anyhow::Result;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::port::ModemPort;
use crate::config::{Config, DTMF_DIGITS, RTP_LEN};

/// Timeout between two rings before the caller is considered gone.
const RING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(7);

/// Pause after RING before the caller-ID report is requested.
const CALLER_ID_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

/// The modem's voice transmit queue stalls around this depth; skip writes
/// beyond it (the reported count is unreliable on some firmwares).
const TX_QUEUE_LIMIT: usize = 6401;

// Modem reply strings
const CRLF: &[u8] = b"\r\n";
const OK_STR: &[u8] = b"OK\r\n";
const ERROR_STR: &[u8] = b"ERROR\r\n";
const CONNECT_STR: &[u8] = b"CONNECT\r\n";
const RING_STR: &[u8] = b"RING\r\n";
const NMBR_STR: &[u8] = b"NMBR=";

// Modem AT command set
const TERMINATE_CALL: &[u8] = b"ATH\r\n";
const FACTORY_RESET: &[u8] = b"AT&F0\r\n";
const ECHO_OFF: &[u8] = b"ATE0\r\n";
const ENABLE_VERBOSE_CODES: &[u8] = b"ATV1\r\n";
const ENTER_DATA_MODE: &[u8] = b"AT+FCLASS=0\r\n";
const ENTER_VOICE_MODE: &[u8] = b"AT+FCLASS=8\r\n";
const ENABLE_FORMATTED_CID: &[u8] = b"AT+VCID=1\r\n";
const REPORT_CID: &[u8] = b"AT+VRID=0\r\n";
const ENABLE_CALL_WAITING: &[u8] = b"AT+PCW=1\r\n";
const DISABLE_SILENCE_DETECTION: &[u8] = b"AT+VSD=128,0\r\n";
const DTMF_DURATION: &[u8] = b"AT+VTD=30\r\n"; // 300 ms
const RECEIVE_GAIN: &[u8] = b"AT+VGR=255\r\n";
const TRANSMIT_GAIN: &[u8] = b"AT+VGT=128\r\n";
const SET_VOICE_COMPRESSION: &[u8] = b"AT+VSM=1,8000,0,0\r\n"; // 8-bit unsigned PCM, 8 kHz
const LINE_ON_HOOK: &[u8] = b"AT+VLS=0\r\n";
const LINE_OFF_HOOK: &[u8] = b"AT+VLS=1\r\n"; // connected to telco
const ENTER_VOICE_DUPLEX: &[u8] = b"AT+VTR\r\n";
const SEND_DTMF: &[u8] = b"AT+VTS=";

// DLE shielded codes, DCE to DTE
const DLE_CHAR: u8 = 0x10;
/// Inaudible byte the DLE pairs are rewritten to
const DLE_ERASER: u8 = 0x11;
const DCE_END_VOICE_DATA: u8 = 0x03; // <DLE><ETX>
const DCE_BUSY_TONE: u8 = b'b';
const DCE_DIAL_TONE: u8 = b'd';
const DCE_SILENCE_DETECTED: u8 = b's';
const DCE_TX_BUFFER_UNDERRUN: u8 = b'u';
const DCE_RX_BUFFER_OVERRUN: u8 = b'o';

// DLE shielded codes, DTE to DCE
const DTE_END_VOICE_DUPLEX: &[u8] = &[DLE_CHAR, b'^'];
const DCE_END_VOICE_RESPONSE: &[u8] = &[DLE_CHAR, DCE_END_VOICE_DATA];

/// Line-side call state, the driver's half of the bridge's coarse view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Inactive,
    Idle,
    Ringing,
    Connected,
    HangingUp,
}

pub struct Line {
    port: Box<dyn ModemPort>,
    config: Arc<Config>,
    state: LineState,
    /// Accumulated data-mode bytes, kept across commands so reports like
    /// NMBR= can be fished out afterwards
    response: Vec<u8>,
    caller_id: String,
    dtmf: Option<char>,
    /// Long-term mean of the positive half-cycle, echo heuristic state
    mean_level: i32,
    echo_until: Option<Instant>,
    /// One-shot: duplicate the next voice write after a reported underrun
    underrun: bool,
    ring_counter: u32,
    ring_timer: Option<Instant>,
}

impl Line {
    pub fn new(port: Box<dyn ModemPort>, config: Arc<Config>) -> Self {
        debug!("Modem initialized");
        Self {
            port,
            config,
            state: LineState::Inactive,
            response: Vec::new(),
            caller_id: String::new(),
            dtmf: None,
            mean_level: 128,
            echo_until: None,
            underrun: false,
            ring_counter: 0,
            ring_timer: None,
        }
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn ring_counter(&self) -> u32 {
        self.ring_counter
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    /// Put the modem into a known data-mode state.
    pub fn start(&mut self) -> Result<()> {
        self.port.clear_queues()?;
        self.command(TERMINATE_CALL, Some(OK_STR)); // hang up if opened
        self.command(FACTORY_RESET, Some(OK_STR));
        self.command(ECHO_OFF, Some(OK_STR));
        let country = format!("AT+GCI={}\r\n", self.config.modem_country_code);
        self.command(country.as_bytes(), Some(OK_STR));
        self.command(ENABLE_VERBOSE_CODES, Some(OK_STR));
        self.command(ENTER_DATA_MODE, Some(OK_STR));
        self.command(ENABLE_FORMATTED_CID, Some(OK_STR));
        self.command(ENABLE_CALL_WAITING, Some(OK_STR));
        self.state = LineState::Idle;
        info!("Line started, state IDLE");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state = LineState::Inactive;
        info!("Line stopped");
    }

    /// Write an AT command; when `expect` is given, accumulate serial
    /// input until the expected terminator or ERROR shows up, bounded by
    /// RESPONSE_TIMEOUT. Leftover bytes stay buffered for inspection.
    pub fn command(&mut self, cmd: &[u8], expect: Option<&[u8]>) {
        self.response.clear();
        self.underrun = false;
        if let Err(e) = self.port.write_all(cmd) {
            error!("Modem write failed: {}", e);
            return;
        }
        debug!("Modem command sent: {}", String::from_utf8_lossy(cmd).trim_end());
        let expect = match expect {
            Some(expect) => expect,
            None => return,
        };

        // Intentional bounded blocking; only used during setup/teardown.
        let deadline = std::time::Instant::now() + self.config.response_timeout;
        let mut ok = false;
        while std::time::Instant::now() < deadline {
            match self.port.read_available() {
                Ok(bytes) => self.response.extend_from_slice(&bytes),
                Err(e) => {
                    error!("Modem read failed: {}", e);
                    break;
                }
            }
            if contains(&self.response, expect) {
                ok = true;
                break;
            }
            if contains(&self.response, ERROR_STR) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        debug!(
            "Modem response: {}",
            String::from_utf8_lossy(&self.response).trim_end()
        );
        if !ok {
            error!("Modem AT command response error or timeout");
        }
    }

    /// Lift the line into voice duplex: raw PCM with inline DLE codes.
    pub fn start_voice_mode(&mut self) {
        if self.state != LineState::Connected {
            self.command(ENTER_VOICE_MODE, Some(OK_STR));
            self.command(DISABLE_SILENCE_DETECTION, Some(OK_STR));
            self.command(DTMF_DURATION, Some(OK_STR));
            self.command(RECEIVE_GAIN, Some(OK_STR));
            self.command(TRANSMIT_GAIN, Some(OK_STR));
            self.command(SET_VOICE_COMPRESSION, Some(OK_STR));
            self.command(LINE_OFF_HOOK, Some(OK_STR));
            self.command(ENTER_VOICE_DUPLEX, Some(CONNECT_STR));
        }
        self.reset_call_state();
        self.state = LineState::Connected;
        info!("Line state CONNECTED (voice mode)");
    }

    /// Back to data mode: end voice duplex, on-hook, re-enable caller-ID.
    pub fn stop_voice_mode(&mut self) {
        if let Err(e) = self.port.clear_queues() {
            warn!("Failed to clear modem queues: {}", e);
        }
        if matches!(self.state, LineState::Connected | LineState::HangingUp) {
            self.command(DTE_END_VOICE_DUPLEX, Some(DCE_END_VOICE_RESPONSE));
            self.command(LINE_ON_HOOK, Some(OK_STR));
            self.command(TERMINATE_CALL, Some(OK_STR));
        }
        self.command(ENTER_DATA_MODE, Some(OK_STR));
        self.command(ENABLE_FORMATTED_CID, Some(OK_STR));
        self.reset_call_state();
        self.state = LineState::Idle;
        info!("Line state IDLE (data mode)");
    }

    fn reset_call_state(&mut self) {
        self.caller_id.clear();
        self.dtmf = None;
        self.mean_level = 128;
        self.echo_until = None;
        self.underrun = false;
        self.ring_counter = 0;
        self.ring_timer = None;
    }

    /// Data-mode service: ring detection, caller-ID capture, inter-ring
    /// timeout. Driven once per bridge tick.
    pub fn poll(&mut self) {
        if self.state == LineState::Connected {
            return;
        }
        if self.port.in_queue_len() > 0 {
            match self.port.read_available() {
                Ok(bytes) => self.response.extend_from_slice(&bytes),
                Err(e) => {
                    error!("Modem read failed: {}", e);
                    return;
                }
            }
            if self.response.is_empty() {
                return;
            }
            debug!("Modem report: {}", String::from_utf8_lossy(&self.response).trim_end());
            if contains(&self.response, RING_STR) {
                self.ring_timer = Some(Instant::now() + RING_TIMEOUT); // every ring restarts it
                self.ring_counter += 1;
                if self.state != LineState::Ringing {
                    self.state = LineState::Ringing;
                    // give the caller-ID report time to arrive
                    std::thread::sleep(CALLER_ID_DELAY);
                    self.command(REPORT_CID, Some(OK_STR));
                    if let Some(cid) = extract_caller_id(&self.response) {
                        info!("{} calling", cid);
                        self.caller_id = cid;
                    }
                }
                self.response.clear();
            } else if contains(&self.response, OK_STR) {
                self.response.clear(); // unhandled report
            }
        } else if let Some(timer) = self.ring_timer {
            if Instant::now() > timer {
                warn!("Caller gave up, ring timeout");
                self.ring_timer = None;
                self.ring_counter = 0;
                self.state = LineState::Idle;
            }
        }
    }

    /// Voice-mode receive: drain the modem buffer once it holds a frame,
    /// demultiplex DLE-shielded codes, return the audio. Both the DLE and
    /// its code byte are rewritten to the eraser value; downstream
    /// tolerates the two odd samples.
    pub fn read_audio(&mut self) -> Option<Vec<u8>> {
        if self.state != LineState::Connected {
            return None;
        }
        if self.port.in_queue_len() < RTP_LEN {
            return None;
        }
        let mut data = match self.port.read_available() {
            Ok(data) => data,
            Err(e) => {
                error!("Modem voice read failed: {}", e);
                return None;
            }
        };
        if data.is_empty() {
            return None;
        }

        let len = data.len();
        let mut search = 0;
        while let Some(found) = find_byte(&data, search, DLE_CHAR) {
            data[found] = DLE_ERASER;
            let code = found + 1;
            if code == len {
                break; // code byte not in this buffer
            }
            match data[code] {
                DLE_CHAR => {} // literal 0x10 in audio
                DCE_BUSY_TONE => {
                    warn!("Busy tone detected, call will be disconnected");
                    self.state = LineState::HangingUp;
                }
                DCE_DIAL_TONE => {
                    warn!("Dial tone detected, call will be disconnected");
                    self.state = LineState::HangingUp;
                }
                DCE_SILENCE_DETECTED => {
                    warn!("Silence detected, call will be disconnected");
                    self.state = LineState::HangingUp;
                }
                DCE_END_VOICE_DATA => {
                    warn!("<DLE><ETX> received, call will be disconnected");
                    self.state = LineState::HangingUp;
                }
                DCE_TX_BUFFER_UNDERRUN => {
                    warn!("Modem TX buffer underrun");
                    self.underrun = true;
                }
                DCE_RX_BUFFER_OVERRUN => {
                    warn!("Modem RX buffer overrun");
                }
                code_byte if DTMF_DIGITS.contains(code_byte as char) => {
                    debug!("DTMF {} received from line", code_byte as char);
                    self.dtmf = Some(code_byte as char);
                }
                other => {
                    debug!("Unhandled <DLE><{:#04x}> received", other);
                }
            }
            data[code] = DLE_ERASER;
            // deliberately rescan from the code byte position
            search = code;
        }
        Some(data)
    }

    /// Voice-mode transmit. DLE bytes are flattened to the eraser (no
    /// escape expansion needed for our direction), the echo heuristic is
    /// fed, and a reported underrun makes this frame go out twice.
    pub fn write_audio(&mut self, frame: &[u8]) {
        if self.state != LineState::Connected || frame.is_empty() {
            return;
        }
        if self.port.out_queue_len() >= TX_QUEUE_LIMIT {
            return;
        }

        let mut data = frame.to_vec();
        for byte in data.iter_mut() {
            if *byte == DLE_CHAR {
                *byte = DLE_ERASER;
            }
        }

        if self.config.echo_cancel_delta != 0 {
            self.detect_echo(&data);
        }

        if let Err(e) = self.port.write_all(&data) {
            error!("Modem voice write failed: {}", e);
            return;
        }
        if self.underrun {
            // one-shot compensation for the reported underrun
            if let Err(e) = self.port.write_all(&data) {
                error!("Modem voice write failed: {}", e);
            }
            self.underrun = false;
        }
    }

    /// Mean of the first up to 10 positive-half samples; a jump against
    /// the running mean, or a running mean sitting above the bias, arms
    /// the suppression window.
    fn detect_echo(&mut self, data: &[u8]) {
        let delta = self.config.echo_cancel_delta as i32;
        let mut sum = 0i32;
        let mut count = 0i32;
        for &v in data {
            if v > 128 {
                sum += v as i32;
                count += 1;
                if count == 10 {
                    break;
                }
            }
        }
        if count == 0 {
            return;
        }
        let mean = sum / count;
        if (self.mean_level - mean).abs() > delta {
            self.echo_until = Some(Instant::now() + self.config.echo_cancel_time);
        }
        self.mean_level = (self.mean_level + mean) / 2;
        if self.mean_level > 128 + delta {
            self.echo_until = Some(Instant::now() + self.config.echo_cancel_time);
        }
    }

    /// True while the suppression window is armed; the bridge substitutes
    /// silence on the SIP-bound path during it.
    pub fn echo_suppressed(&mut self) -> bool {
        match self.echo_until {
            Some(until) if Instant::now() > until => {
                self.echo_until = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Last DTMF digit pressed on the line, if any.
    pub fn read_dtmf(&mut self) -> Option<char> {
        self.dtmf.take()
    }

    /// Play a DTMF tone onto the line.
    pub fn send_dtmf(&mut self, digit: char) {
        let mut cmd = SEND_DTMF.to_vec();
        cmd.push(digit as u8);
        cmd.extend_from_slice(CRLF);
        if let Err(e) = self.port.write_all(&cmd) {
            error!("Failed to send DTMF: {}", e);
            return;
        }
        debug!("DTMF {} sent to line", digit);
    }

    /// Dial a number; the trailing semicolon keeps the modem in voice mode.
    pub fn dial(&mut self, number: &str) {
        let cmd = format!("ATD{};\r\n", number);
        self.command(cmd.as_bytes(), Some(OK_STR));
        info!("{} dialed", number);
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn find_byte(data: &[u8], from: usize, needle: u8) -> Option<usize> {
    data[from..].iter().position(|&b| b == needle).map(|p| from + p)
}

/// Digits between NMBR= and the next CRLF in a caller-ID report.
fn extract_caller_id(response: &[u8]) -> Option<String> {
    let start = response
        .windows(NMBR_STR.len())
        .position(|w| w == NMBR_STR)?
        + NMBR_STR.len();
    let end = response[start..]
        .windows(CRLF.len())
        .position(|w| w == CRLF)
        .map(|p| start + p)
        .unwrap_or(response.len());
    let cid = String::from_utf8_lossy(&response[start..end]).trim().to_string();
    (!cid.is_empty()).then_some(cid)
}
