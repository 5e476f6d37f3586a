//! Configuration module
//!
//! Provides typed access to environment variables for pstnlink, plus the
//! fixed timing constants shared by the SIP agent, the line driver and the
//! bridge.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// PCMU/PCMA sample frequency, one byte per sample.
pub const SAMPLE_FREQ: usize = 8000;

/// Bridge tick period. The RTP frame is 20 ms, so roughly every other tick
/// moves a frame.
pub const LOOP_TIME: Duration = Duration::from_millis(10);

/// Samples moved per tick at the bridge boundary (8000 * 0.01).
pub const CHUNK_SIZE: usize = 80;

/// RTP audio payload length: 20 ms at 8 kHz.
pub const RTP_LEN: usize = 160;

/// DTMF event set; the index of a digit is its RFC 2833 event id.
pub const DTMF_DIGITS: &str = "0123456789*#ABCD";

/// The recognized option set; each variant maps to one environment
/// variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    // Modem / PSTN line
    ModemPort,
    ModemCountryCode,
    EchoCancelDelta,
    EchoCancelTime,

    // SIP identity
    IpPbxUser,
    IpPbxDomain,
    IpPbxPass,

    // Outbound proxy
    IpPbxProxyAddress,
    IpPbxProxyPort,

    // Local SIP bind
    IpPhoneIp,
    IpPhonePort,

    // RTP port range
    RtpLow,
    RtpHigh,

    // Registration
    RegisterExpires,

    // Bridge timers
    ResponseTimeout,
    AnswerTimeout,
    DialTimeout,
    MaxSessionDuration,
    AnswerAfterRings,

    // Routing policy
    LocalPbx,
    LineCanDial,
    CallForwardTo,
    IpPhoneCidIsNumber,

    // Session capture
    RecordingEnabled,
}

impl ConfigKey {
    /// Environment variable this key is read from
    pub fn env_var(&self) -> &'static str {
        match self {
            ConfigKey::ModemPort => "MODEM_PORT",
            ConfigKey::ModemCountryCode => "MODEM_COUNTRY_CODE",
            ConfigKey::EchoCancelDelta => "ECHO_CANCEL_DELTA",
            ConfigKey::EchoCancelTime => "ECHO_CANCEL_TIME",
            ConfigKey::IpPbxUser => "IP_PBX_USER",
            ConfigKey::IpPbxDomain => "IP_PBX_DOMAIN",
            ConfigKey::IpPbxPass => "IP_PBX_PASS",
            ConfigKey::IpPbxProxyAddress => "IP_PBX_PROXY_ADDRESS",
            ConfigKey::IpPbxProxyPort => "IP_PBX_PROXY_PORT",
            ConfigKey::IpPhoneIp => "IP_PHONE_IP",
            ConfigKey::IpPhonePort => "IP_PHONE_PORT",
            ConfigKey::RtpLow => "RTP_LOW",
            ConfigKey::RtpHigh => "RTP_HIGH",
            ConfigKey::RegisterExpires => "REGISTER_EXPIRES",
            ConfigKey::ResponseTimeout => "RESPONSE_TIMEOUT",
            ConfigKey::AnswerTimeout => "ANSWER_TIMEOUT",
            ConfigKey::DialTimeout => "DIAL_TIMEOUT",
            ConfigKey::MaxSessionDuration => "MAX_SESSION_DURATION",
            ConfigKey::AnswerAfterRings => "ANSWER_AFTER_RINGS",
            ConfigKey::LocalPbx => "LOCAL_PBX",
            ConfigKey::LineCanDial => "LINE_CAN_DIAL",
            ConfigKey::CallForwardTo => "CALL_FORWARD_TO",
            ConfigKey::IpPhoneCidIsNumber => "IP_PHONE_CID_IS_NUMBER",
            ConfigKey::RecordingEnabled => "RECORDING_ENABLED",
        }
    }

    /// Keys without a default must be present in the environment
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            ConfigKey::IpPbxUser
                | ConfigKey::IpPbxDomain
                | ConfigKey::IpPbxPass
                | ConfigKey::IpPhoneIp
        )
    }

    /// Built-in default, where one exists
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            ConfigKey::ModemPort => Some("/dev/ttyACM0"),
            ConfigKey::ModemCountryCode => Some("AE"),
            ConfigKey::EchoCancelDelta => Some("0"),
            ConfigKey::EchoCancelTime => Some("0.2"),
            ConfigKey::IpPbxProxyPort => Some("5060"),
            ConfigKey::IpPhonePort => Some("5060"),
            ConfigKey::RtpLow => Some("10000"),
            ConfigKey::RtpHigh => Some("20000"),
            ConfigKey::RegisterExpires => Some("60"),
            ConfigKey::ResponseTimeout => Some("5"),
            ConfigKey::AnswerTimeout => Some("28"),
            ConfigKey::DialTimeout => Some("30"),
            ConfigKey::MaxSessionDuration => Some("180"),
            ConfigKey::AnswerAfterRings => Some("1"),
            ConfigKey::LocalPbx => Some("false"),
            ConfigKey::LineCanDial => Some("false"),
            ConfigKey::CallForwardTo => Some(""),
            ConfigKey::IpPhoneCidIsNumber => Some("false"),
            ConfigKey::RecordingEnabled => Some("false"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device the voice modem is attached to
    pub modem_port: String,
    /// Two-letter code appended to `AT+GCI=`
    pub modem_country_code: String,
    /// Echo suppression threshold; 0 disables the feature
    pub echo_cancel_delta: u8,
    /// Length of one echo suppression window
    pub echo_cancel_time: Duration,

    // SIP identity used for REGISTER and digest authentication
    pub sip_user: String,
    pub sip_domain: String,
    pub sip_pass: String,

    // Outbound proxy (defaults to the domain when unset)
    pub proxy_address: String,
    pub proxy_port: u16,

    // Local SIP bind
    pub phone_ip: String,
    pub phone_port: u16,

    // RTP port range; a random port in [low, high] is picked per dialog
    pub rtp_low: u16,
    pub rtp_high: u16,

    /// REGISTER Expires value in seconds; refresh fires at expires - 5
    pub register_expires: u32,

    // Bridge timers
    pub response_timeout: Duration,
    pub answer_timeout: Duration,
    pub dial_timeout: Duration,
    pub max_session_duration: Duration,
    pub answer_after_rings: u32,

    // Routing policy
    pub local_pbx: bool,
    pub line_can_dial: bool,
    pub call_forward_to: String,
    pub ip_phone_cid_is_number: bool,

    /// Capture line audio of each session to a WAV file
    pub recording_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // a missing .env is fine
        Self::from_getter(|key| env::var(key.env_var()).ok())
    }

    /// Build the config through an arbitrary key lookup; tests feed maps
    /// through this instead of touching the process environment.
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(ConfigKey) -> Option<String>,
    {
        fn with_default<F>(get: &F, key: ConfigKey) -> String
        where
            F: Fn(ConfigKey) -> Option<String>,
        {
            get(key).unwrap_or_else(|| key.default_value().unwrap().to_string())
        }

        fn parse_num<T, F>(get: &F, key: ConfigKey) -> Result<T>
        where
            T: std::str::FromStr,
            T::Err: std::error::Error + Send + Sync + 'static,
            F: Fn(ConfigKey) -> Option<String>,
        {
            with_default(get, key)
                .parse()
                .context(format!("{} must be a number", key.env_var()))
        }

        fn parse_bool<F>(get: &F, key: ConfigKey) -> bool
        where
            F: Fn(ConfigKey) -> Option<String>,
        {
            matches!(
                with_default(get, key).to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        }

        fn parse_secs<F>(get: &F, key: ConfigKey) -> Result<Duration>
        where
            F: Fn(ConfigKey) -> Option<String>,
        {
            let secs: f64 = with_default(get, key)
                .parse()
                .context(format!("{} must be seconds", key.env_var()))?;
            Duration::try_from_secs_f64(secs)
                .context(format!("{} must be a non-negative duration", key.env_var()))
        }

        let sip_domain = get(ConfigKey::IpPbxDomain).context(ConfigKey::IpPbxDomain.env_var())?;
        let proxy_address = get(ConfigKey::IpPbxProxyAddress)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| sip_domain.clone());

        Ok(Config {
            modem_port: with_default(&get, ConfigKey::ModemPort),
            modem_country_code: with_default(&get, ConfigKey::ModemCountryCode),
            echo_cancel_delta: parse_num(&get, ConfigKey::EchoCancelDelta)?,
            echo_cancel_time: parse_secs(&get, ConfigKey::EchoCancelTime)?,

            sip_user: get(ConfigKey::IpPbxUser).context(ConfigKey::IpPbxUser.env_var())?,
            sip_pass: get(ConfigKey::IpPbxPass).context(ConfigKey::IpPbxPass.env_var())?,
            sip_domain,

            proxy_address,
            proxy_port: parse_num(&get, ConfigKey::IpPbxProxyPort)?,

            phone_ip: get(ConfigKey::IpPhoneIp).context(ConfigKey::IpPhoneIp.env_var())?,
            phone_port: parse_num(&get, ConfigKey::IpPhonePort)?,

            rtp_low: parse_num(&get, ConfigKey::RtpLow)?,
            rtp_high: parse_num(&get, ConfigKey::RtpHigh)?,

            register_expires: parse_num(&get, ConfigKey::RegisterExpires)?,

            response_timeout: parse_secs(&get, ConfigKey::ResponseTimeout)?,
            answer_timeout: parse_secs(&get, ConfigKey::AnswerTimeout)?,
            dial_timeout: parse_secs(&get, ConfigKey::DialTimeout)?,
            max_session_duration: parse_secs(&get, ConfigKey::MaxSessionDuration)?,
            answer_after_rings: parse_num(&get, ConfigKey::AnswerAfterRings)?,

            local_pbx: parse_bool(&get, ConfigKey::LocalPbx),
            line_can_dial: parse_bool(&get, ConfigKey::LineCanDial),
            call_forward_to: with_default(&get, ConfigKey::CallForwardTo),
            ip_phone_cid_is_number: parse_bool(&get, ConfigKey::IpPhoneCidIsNumber),

            recording_enabled: parse_bool(&get, ConfigKey::RecordingEnabled),
        })
    }

    /// Shorthand over `from_getter` for map-backed test configs.
    pub fn from_map(map: &std::collections::HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key.env_var()).map(|v| v.to_string()))
    }

    /// Startup sanity checks; all failures are reported in one error.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.rtp_low > self.rtp_high {
            errors.push(format!(
                "RTP_HIGH ({}) must be >= RTP_LOW ({})",
                self.rtp_high, self.rtp_low
            ));
        }

        if self.sip_user.is_empty() {
            errors.push("IP_PBX_USER must not be empty".to_string());
        }

        if self.phone_ip.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("IP_PHONE_IP '{}' is not an IP address", self.phone_ip));
        }

        if self.register_expires < 10 {
            errors.push(format!(
                "REGISTER_EXPIRES ({}) too small; refresh fires at expires - 5",
                self.register_expires
            ));
        }

        // When the line cannot dial, every PSTN call is forwarded, so the
        // forward target must exist.
        if self.call_forward_to.is_empty() && !(self.local_pbx && self.line_can_dial) {
            errors.push("CALL_FORWARD_TO must be set unless LOCAL_PBX and LINE_CAN_DIAL".to_string());
        }

        if self.answer_after_rings == 0 {
            errors.push("ANSWER_AFTER_RINGS must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration invalid:\n  - {}", errors.join("\n  - "))
        }
    }
}
