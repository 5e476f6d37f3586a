/// Prompt playback
///
/// Dial and ringback prompts are RIFF/WAVE, mono, 8 kHz, 8-bit unsigned
/// PCM, fed to whichever leg initiated the call one chunk per tick. A
/// missing prompt file logs a warning and plays nothing; it never aborts
/// the call.

use std::fs::File;
use std::io::BufReader;
use tracing::{debug, warn};

use crate::config::CHUNK_SIZE;

pub const DIAL_PROMPT: &str = "dial.wav";
pub const RINGBACK_PROMPT: &str = "ringback.wav";

pub struct PromptPlayer {
    reader: Option<hound::WavReader<BufReader<File>>>,
}

impl PromptPlayer {
    pub fn new() -> Self {
        Self { reader: None }
    }

    /// Start playing `path` once; ignored while another prompt is active.
    pub fn start(&mut self, path: &str) {
        if self.reader.is_some() {
            return;
        }
        match hound::WavReader::open(path) {
            Ok(reader) => {
                let spec = reader.spec();
                if spec.channels != 1 || spec.sample_rate != 8000 || spec.bits_per_sample != 8 {
                    warn!(
                        "Prompt {} has unsupported format {:?}, skipping playback",
                        path, spec
                    );
                    return;
                }
                debug!("{} playing", path);
                self.reader = Some(reader);
            }
            Err(e) => warn!("Cannot open prompt {}: {}", path, e),
        }
    }

    pub fn stop(&mut self) {
        if self.reader.take().is_some() {
            debug!("prompt playback stopped");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.reader.is_some()
    }

    /// One tick worth of samples as unsigned 8-bit PCM, or None when the
    /// file is exhausted (playback stops itself).
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let reader = self.reader.as_mut()?;
        let mut chunk = Vec::with_capacity(CHUNK_SIZE);
        // hound hands 8-bit WAV samples out as i8 centered on zero
        for sample in reader.samples::<i8>().take(CHUNK_SIZE) {
            match sample {
                Ok(value) => chunk.push((value as i16 + 128) as u8),
                Err(e) => {
                    warn!("Prompt read error: {}", e);
                    break;
                }
            }
        }
        if chunk.is_empty() {
            self.stop();
            return None;
        }
        Some(chunk)
    }
}

impl Default for PromptPlayer {
    fn default() -> Self {
        Self::new()
    }
}
