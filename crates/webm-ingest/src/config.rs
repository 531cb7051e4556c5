//! Settings shared by the probe and decode stages.

use std::time::Duration;

use anyhow::{Result, bail};

/// Bytes of stderr kept from each subprocess when none is configured.
pub const DEFAULT_STDERR_CAPACITY: usize = 16 * 1024;

/// Canonical configuration for a [`crate::Decoder`].
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Program used to decode the bitstream.
    pub ffmpeg_program: String,
    /// Program used to discover stream metadata.
    pub ffprobe_program: String,
    /// Decoder selected with `-c:v` on the input side.
    pub input_codec: String,
    /// Upper bound on the probe step. `None` waits indefinitely.
    pub probe_timeout: Option<Duration>,
    /// Upper bound on feed, read and reap together. `None` waits indefinitely.
    pub decode_timeout: Option<Duration>,
    /// Size of the ring buffer holding the tail of each subprocess's stderr.
    pub stderr_capacity: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_program: "ffmpeg".into(),
            ffprobe_program: "ffprobe".into(),
            input_codec: "libvpx-vp9".into(),
            probe_timeout: None,
            decode_timeout: None,
            stderr_capacity: DEFAULT_STDERR_CAPACITY,
        }
    }
}

impl DecoderConfig {
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn with_decode_timeout(mut self, timeout: Duration) -> Self {
        self.decode_timeout = Some(timeout);
        self
    }

    /// Reject settings that would make every decode call fail.
    pub fn validate(&self) -> Result<()> {
        if self.ffmpeg_program.trim().is_empty() {
            bail!("ffmpeg program must not be empty");
        }
        if self.ffprobe_program.trim().is_empty() {
            bail!("ffprobe program must not be empty");
        }
        if self.input_codec.trim().is_empty() {
            bail!("input codec must not be empty");
        }
        if self.stderr_capacity == 0 {
            bail!("stderr capacity must be at least 1 byte");
        }
        if self.probe_timeout.is_some_and(|t| t.is_zero()) {
            bail!("probe timeout must be greater than zero");
        }
        if self.decode_timeout.is_some_and(|t| t.is_zero()) {
            bail!("decode timeout must be greater than zero");
        }
        Ok(())
    }
}
