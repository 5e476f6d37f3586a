/// Session recording
///
/// When enabled, each cross-connected session is captured to a WAV file
/// (8 kHz, mono, 8-bit unsigned PCM) named after the two parties with the
/// initiating side first. Only line-received frames are recorded; mixing
/// the return direction in is out of scope.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use tracing::{debug, warn};

use crate::config::SAMPLE_FREQ;

pub struct CallRecorder {
    writer: hound::WavWriter<BufWriter<File>>,
    path: String,
}

impl CallRecorder {
    /// Open `<YYYYMMDD-HHMMSS>_<from>_to_<to>.wav` in the working
    /// directory. Non-number characters are stripped from the party
    /// strings; an empty party becomes "X".
    pub fn start(from: &str, to: &str) -> Result<Self> {
        let path = format!(
            "{}_{}_to_{}.wav",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            sanitize_party(from),
            sanitize_party(to)
        );
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_FREQ as u32,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .context(format!("Failed to create recording {}", path))?;
        debug!("{} recording", path);
        Ok(Self { writer, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Append one frame of unsigned 8-bit PCM.
    pub fn write(&mut self, frame: &[u8]) {
        for &sample in frame {
            // hound's 8-bit convention is i8 centered on zero
            if let Err(e) = self.writer.write_sample((sample as i16 - 128) as i8) {
                warn!("Recording write failed: {}", e);
                return;
            }
        }
    }

    pub fn finalize(self) {
        debug!("{} closed", self.path);
        if let Err(e) = self.writer.finalize() {
            warn!("Failed to finalize recording: {}", e);
        }
    }
}

/// Strip DTMF control characters; "X" stands in for an unknown party.
fn sanitize_party(number: &str) -> String {
    let trimmed: String = number.chars().filter(|c| !"*#ABCD".contains(*c)).collect();
    if trimmed.is_empty() {
        "X".to_string()
    } else {
        trimmed
    }
}
