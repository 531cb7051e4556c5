use std::fmt;

use serde::Serialize;
use webm_ingest::{DecodedVideo, VideoStreamInfo};

/// What the binary reports about a probed or decoded buffer.
#[derive(Debug, Serialize)]
pub(crate) struct Summary {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) frame_rate: u32,
    pub(crate) frame_rate_ratio: String,
    pub(crate) codec: Option<String>,
    pub(crate) frame_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) frames: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) decoder_exit_code: Option<i32>,
}

impl Summary {
    pub(crate) fn from_probe(info: &VideoStreamInfo) -> Self {
        Self {
            width: info.width,
            height: info.height,
            frame_rate: info.frame_rate,
            frame_rate_ratio: format!("{}/{}", info.frame_rate_ratio.0, info.frame_rate_ratio.1),
            codec: info.codec_name.clone(),
            frame_bytes: info.frame_byte_size(),
            frames: None,
            decoder_exit_code: None,
        }
    }

    pub(crate) fn from_decoded(video: &DecodedVideo) -> Self {
        Self {
            frames: Some(video.frames.len()),
            decoder_exit_code: video
                .decoder_diagnostics
                .as_ref()
                .and_then(|d| d.exit_code),
            ..Self::from_probe(&video.info)
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "resolution: {}x{}", self.width, self.height)?;
        writeln!(
            f,
            "frame rate: {} ({})",
            self.frame_rate, self.frame_rate_ratio
        )?;
        writeln!(f, "codec:      {}", self.codec.as_deref().unwrap_or("unknown"))?;
        writeln!(f, "frame size: {} bytes", self.frame_bytes)?;
        if let Some(frames) = self.frames {
            writeln!(f, "frames:     {frames}")?;
        }
        if let Some(code) = self.decoder_exit_code {
            writeln!(f, "decoder exited with status {code}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> VideoStreamInfo {
        VideoStreamInfo {
            width: 64,
            height: 48,
            frame_rate: 30,
            frame_rate_ratio: (30, 1),
            codec_name: Some("vp9".into()),
        }
    }

    #[test]
    fn probe_summary_omits_frame_count_in_json() {
        let summary = Summary::from_probe(&info());
        let json: serde_json::Value = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["width"], 64);
        assert_eq!(json["frame_bytes"], 12_288);
        assert_eq!(json["frame_rate_ratio"], "30/1");
        assert!(json.get("frames").is_none());
    }

    #[test]
    fn decoded_summary_reports_frames() {
        let video = DecodedVideo {
            info: info(),
            frames: Vec::new(),
            decoder_diagnostics: None,
        };
        let text = Summary::from_decoded(&video).to_string();
        assert!(text.contains("resolution: 64x48"));
        assert!(text.contains("frames:     0"));
        assert!(!text.contains("exited"));
    }
}
