use std::{io, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Bytes per pixel of every frame emitted by the decoder subprocess.
pub const BYTES_PER_PIXEL: usize = 4;

/// Raw BGRA frame decoded from a WebM buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Position in decode order, starting at zero.
    pub index: u64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// Blue, green, red, alpha; one byte each.
    Bgra8,
}

impl FrameFormat {
    /// Pixel format name understood by ffmpeg's `-pix_fmt`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            FrameFormat::Bgra8 => "bgra",
        }
    }
}

impl Frame {
    /// Row `y` of the pixel grid, `width * 4` bytes long.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let stride = self.width as usize * BYTES_PER_PIXEL;
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }

    /// The pixel at column `x`, row `y` as `[b, g, r, a]`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width {
            return None;
        }
        let row = self.row(y)?;
        let start = x as usize * BYTES_PER_PIXEL;
        let px = row.get(start..start + BYTES_PER_PIXEL)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Video stream parameters discovered by the probe step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    /// Frames per second, taken from the numerator of ffprobe's `r_frame_rate`.
    ///
    /// The denominator is ignored, so `30000/1001` reports `30000` rather than
    /// 29.97. This is a known precision loss kept for compatibility; use
    /// [`VideoStreamInfo::frame_rate_ratio`] when the exact rate matters.
    pub frame_rate: u32,
    /// The raw `(numerator, denominator)` pair reported by ffprobe.
    pub frame_rate_ratio: (u32, u32),
    /// Codec reported for the stream, e.g. `vp9`.
    pub codec_name: Option<String>,
}

impl VideoStreamInfo {
    /// Size in bytes of one BGRA frame at this resolution.
    pub fn frame_byte_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// Stderr captured from a decoder process that exited unsuccessfully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderDiagnostics {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Result of a complete decode call.
#[derive(Clone, Debug)]
pub struct DecodedVideo {
    pub info: VideoStreamInfo,
    /// Frames in decode order, which is presentation order for VP9.
    pub frames: Vec<Frame>,
    /// Set when ffmpeg exited non-zero after its output was drained.
    pub decoder_diagnostics: Option<DecoderDiagnostics>,
}

impl DecodedVideo {
    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn frame_rate(&self) -> u32 {
        self.info.frame_rate
    }
}

/// Stage of a decode call an error originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Probe,
    Decode,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("ffprobe exited with {status}: {stderr}")]
    ProbeFailed {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    #[error("ffprobe output could not be used: {reason}")]
    ProbeParse { reason: String },
    #[error("ffprobe did not finish within {timeout:?}")]
    ProbeTimeout { timeout: Duration },
    #[error("failed to spawn {program:?}")]
    Spawn {
        phase: Phase,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("decoder produced a truncated frame: expected {expected} bytes, received {received}")]
    TruncatedFrame {
        expected: usize,
        received: usize,
        stderr: String,
    },
    #[error("failed to write input to the decoder")]
    FeedFailed(#[source] io::Error),
    #[error("decoder did not finish within {timeout:?}")]
    DecodeTimeout { timeout: Duration, stderr: String },
    #[error("decode was cancelled")]
    Cancelled,
    #[error("i/o error while talking to {program:?}")]
    Io {
        phase: Phase,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DecodeError {
    /// Which stage of the pipeline failed.
    pub fn phase(&self) -> Phase {
        match self {
            DecodeError::ProbeFailed { .. }
            | DecodeError::ProbeParse { .. }
            | DecodeError::ProbeTimeout { .. } => Phase::Probe,
            DecodeError::Spawn { phase, .. } | DecodeError::Io { phase, .. } => *phase,
            DecodeError::TruncatedFrame { .. }
            | DecodeError::FeedFailed(_)
            | DecodeError::DecodeTimeout { .. }
            | DecodeError::Cancelled
            | DecodeError::Other(_) => Phase::Decode,
        }
    }

    pub(crate) fn probe_parse(reason: impl Into<String>) -> Self {
        DecodeError::ProbeParse {
            reason: reason.into(),
        }
    }

    /// Replace the stderr tail carried by decoder failures. Other variants
    /// are returned unchanged.
    pub(crate) fn with_stderr(mut self, text: String) -> Self {
        if let DecodeError::TruncatedFrame { stderr, .. } | DecodeError::DecodeTimeout { stderr, .. } =
            &mut self
        {
            *stderr = text;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_2x2() -> Frame {
        Frame {
            data: (0u8..16).collect(),
            width: 2,
            height: 2,
            index: 0,
            format: FrameFormat::Bgra8,
        }
    }

    #[test]
    fn rows_and_pixels_follow_row_major_layout() {
        let frame = frame_2x2();
        assert_eq!(frame.row(1), Some(&[8u8, 9, 10, 11, 12, 13, 14, 15][..]));
        assert_eq!(frame.pixel(1, 0), Some([4, 5, 6, 7]));
        assert_eq!(frame.pixel(0, 1), Some([8, 9, 10, 11]));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.row(2), None);
    }

    #[test]
    fn frame_byte_size_is_four_bytes_per_pixel() {
        let info = VideoStreamInfo {
            width: 64,
            height: 48,
            frame_rate: 30,
            frame_rate_ratio: (30, 1),
            codec_name: Some("vp9".into()),
        };
        assert_eq!(info.frame_byte_size(), 12_288);
    }

    #[test]
    fn errors_report_their_phase() {
        assert_eq!(DecodeError::probe_parse("no streams").phase(), Phase::Probe);
        assert_eq!(DecodeError::Cancelled.phase(), Phase::Decode);
        let truncated = DecodeError::TruncatedFrame {
            expected: 16,
            received: 3,
            stderr: String::new(),
        };
        assert_eq!(truncated.phase(), Phase::Decode);
        let spawn = DecodeError::Spawn {
            phase: Phase::Probe,
            program: "ffprobe".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(spawn.phase(), Phase::Probe);
    }

    #[test]
    fn with_stderr_only_touches_decoder_failures() {
        let truncated = DecodeError::TruncatedFrame {
            expected: 16,
            received: 3,
            stderr: String::new(),
        }
        .with_stderr("corrupt frame".into());
        assert!(matches!(truncated, DecodeError::TruncatedFrame { ref stderr, .. } if stderr == "corrupt frame"));

        let cancelled = DecodeError::Cancelled.with_stderr("ignored".into());
        assert!(matches!(cancelled, DecodeError::Cancelled));
    }
}
