//! Stream metadata discovery through `ffprobe`.
//!
//! The buffer is piped to ffprobe's stdin and its JSON report is parsed into a
//! [`VideoStreamInfo`]. Probe failures are reported separately from decode
//! failures so callers can tell "not a video" apart from "decoder broke".

use std::{
    io::{self, Read},
    process::Command,
    thread,
    time::Instant,
};

use serde::Deserialize;
use tracing::debug;

use crate::{
    config::DecoderConfig,
    feeder::spawn_scoped_feeder,
    process::ProcessHandle,
    threads::spawn_scoped,
    types::{DecodeError, Phase, VideoStreamInfo},
};

#[derive(Debug, Deserialize)]
struct ProbeReport {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    r_frame_rate: Option<String>,
}

pub(crate) fn probe_command(config: &DecoderConfig) -> Command {
    let mut cmd = Command::new(&config.ffprobe_program);
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-show_format")
        .arg("-show_streams")
        .arg("-of")
        .arg("json")
        .arg("pipe:");
    cmd
}

/// Probe `buffer` and return the parameters of its first video stream.
///
/// An empty buffer is rejected without spawning ffprobe.
pub fn probe(buffer: &[u8], config: &DecoderConfig) -> Result<VideoStreamInfo, DecodeError> {
    if buffer.is_empty() {
        return Err(DecodeError::probe_parse("no streams found in an empty buffer"));
    }

    let started = Instant::now();
    let deadline = config.probe_timeout.map(|timeout| started + timeout);
    let mut process =
        ProcessHandle::spawn(probe_command(config), Phase::Probe, config.stderr_capacity)?;
    let program = process.program().to_string();
    let io_error = |source: io::Error| DecodeError::Io {
        phase: Phase::Probe,
        program: program.clone(),
        source,
    };
    let stdin = process
        .take_stdin()
        .ok_or_else(|| io_error(io::Error::other("stdin was not piped")))?;
    let mut stdout = process
        .take_stdout()
        .ok_or_else(|| io_error(io::Error::other("stdout was not piped")))?;
    let stderr = process.stderr_tail();

    let (status, output) = thread::scope(|scope| -> Result<_, DecodeError> {
        let feeder = spawn_scoped_feeder(scope, stdin, buffer).map_err(io_error)?;
        let collector = spawn_scoped(scope, "ffprobe-stdout", move || {
            let mut out = Vec::new();
            stdout.read_to_end(&mut out).map(|_| out)
        })
        .map_err(io_error)?;

        let status = process.wait_until(deadline)?;

        match feeder.join() {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(io_error(err)),
            Err(_) => return Err(DecodeError::Other(anyhow::anyhow!("probe feeder panicked"))),
        }
        let output = match collector.join() {
            Ok(result) => result.map_err(io_error)?,
            Err(_) => return Err(DecodeError::Other(anyhow::anyhow!("probe reader panicked"))),
        };
        Ok((status, output))
    })?;

    let Some(status) = status else {
        return Err(DecodeError::ProbeTimeout {
            timeout: config.probe_timeout.unwrap_or_default(),
        });
    };
    if !status.success() {
        return Err(DecodeError::ProbeFailed {
            status,
            stdout: String::from_utf8_lossy(&output).into_owned(),
            stderr: stderr.snapshot(),
        });
    }

    let info = parse_probe_output(&output)?;
    debug!(
        width = info.width,
        height = info.height,
        frame_rate = info.frame_rate,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "probe complete"
    );
    Ok(info)
}

/// Extract the first video stream from an ffprobe JSON report.
pub fn parse_probe_output(output: &[u8]) -> Result<VideoStreamInfo, DecodeError> {
    let report: ProbeReport = serde_json::from_slice(output)
        .map_err(|err| DecodeError::probe_parse(format!("invalid ffprobe JSON: {err}")))?;
    if report.streams.is_empty() {
        return Err(DecodeError::probe_parse("no streams found"));
    }

    let stream = report
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| DecodeError::probe_parse("no video stream found"))?;

    let width = positive_dimension("width", stream.width)?;
    let height = positive_dimension("height", stream.height)?;
    let rate = stream
        .r_frame_rate
        .as_deref()
        .ok_or_else(|| DecodeError::probe_parse("video stream has no r_frame_rate"))?;
    let frame_rate_ratio = parse_frame_rate(rate)?;

    Ok(VideoStreamInfo {
        width,
        height,
        frame_rate: frame_rate_ratio.0,
        frame_rate_ratio,
        codec_name: stream.codec_name,
    })
}

fn positive_dimension(name: &str, value: Option<i64>) -> Result<u32, DecodeError> {
    let value =
        value.ok_or_else(|| DecodeError::probe_parse(format!("video stream has no {name}")))?;
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| DecodeError::probe_parse(format!("video stream has invalid {name} {value}")))
}

/// Split an `N/D` rate into its parts.
///
/// Only the numerator decides the frame rate, so fractional rates such as
/// `30000/1001` are not reduced. A missing, zero or malformed denominator is
/// reported as `1`.
pub fn parse_frame_rate(rate: &str) -> Result<(u32, u32), DecodeError> {
    let (num, den) = match rate.trim().split_once('/') {
        Some((num, den)) => (num, Some(den)),
        None => (rate.trim(), None),
    };
    let num: u32 = num
        .trim()
        .parse()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| DecodeError::probe_parse(format!("invalid r_frame_rate {rate:?}")))?;
    let den = den
        .and_then(|den| den.trim().parse::<u32>().ok())
        .filter(|d| *d > 0)
        .unwrap_or(1);
    Ok((num, den))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VP9_REPORT: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "vp9",
                "codec_type": "video",
                "width": 64,
                "height": 48,
                "r_frame_rate": "30/1",
                "avg_frame_rate": "30/1"
            }
        ],
        "format": { "format_name": "matroska,webm" }
    }"#;

    #[test]
    fn parses_first_video_stream() {
        let info = parse_probe_output(VP9_REPORT.as_bytes()).unwrap();
        assert_eq!(info.width, 64);
        assert_eq!(info.height, 48);
        assert_eq!(info.frame_rate, 30);
        assert_eq!(info.frame_rate_ratio, (30, 1));
        assert_eq!(info.codec_name.as_deref(), Some("vp9"));
        assert_eq!(info.frame_byte_size(), 64 * 48 * 4);
    }

    #[test]
    fn skips_audio_streams() {
        let report = r#"{"streams": [
            {"codec_type": "audio", "codec_name": "opus", "r_frame_rate": "0/0"},
            {"codec_type": "video", "codec_name": "vp9", "width": 320, "height": 240, "r_frame_rate": "25/1"},
            {"codec_type": "video", "codec_name": "vp8", "width": 16, "height": 16, "r_frame_rate": "5/1"}
        ]}"#;
        let info = parse_probe_output(report.as_bytes()).unwrap();
        assert_eq!((info.width, info.height, info.frame_rate), (320, 240, 25));
    }

    #[test]
    fn frame_rate_keeps_numerator_only() {
        let report = r#"{"streams": [
            {"codec_type": "video", "width": 1920, "height": 1080, "r_frame_rate": "30000/1001"}
        ]}"#;
        let info = parse_probe_output(report.as_bytes()).unwrap();
        assert_eq!(info.frame_rate, 30000);
        assert_eq!(info.frame_rate_ratio, (30000, 1001));
    }

    #[test]
    fn empty_report_has_no_streams() {
        let err = parse_probe_output(b"{}").unwrap_err();
        assert!(matches!(&err, DecodeError::ProbeParse { reason } if reason == "no streams found"));
        assert_eq!(err.phase(), Phase::Probe);
    }

    #[test]
    fn audio_only_report_is_rejected() {
        let report = r#"{"streams": [{"codec_type": "audio", "codec_name": "vorbis"}]}"#;
        let err = parse_probe_output(report.as_bytes()).unwrap_err();
        assert!(matches!(&err, DecodeError::ProbeParse { reason } if reason == "no video stream found"));
    }

    #[test]
    fn malformed_json_is_a_parse_failure() {
        let err = parse_probe_output(b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::ProbeParse { .. }));
    }

    #[test]
    fn missing_or_zero_dimensions_are_rejected() {
        let report = r#"{"streams": [{"codec_type": "video", "height": 48, "r_frame_rate": "30/1"}]}"#;
        assert!(parse_probe_output(report.as_bytes()).is_err());

        let report = r#"{"streams": [{"codec_type": "video", "width": 0, "height": 48, "r_frame_rate": "30/1"}]}"#;
        assert!(parse_probe_output(report.as_bytes()).is_err());
    }

    #[test]
    fn frame_rate_strings() {
        assert_eq!(parse_frame_rate("24/1").unwrap(), (24, 1));
        assert_eq!(parse_frame_rate("60").unwrap(), (60, 1));
        assert_eq!(parse_frame_rate(" 25 / 2 ").unwrap(), (25, 2));
        assert!(parse_frame_rate("0/0").is_err());
        assert!(parse_frame_rate("abc/1").is_err());
    }

    #[test]
    fn malformed_denominator_falls_back_to_one() {
        assert_eq!(parse_frame_rate("30/x").unwrap(), (30, 1));
        assert_eq!(parse_frame_rate("30/").unwrap(), (30, 1));
        assert_eq!(parse_frame_rate("24/0").unwrap(), (24, 1));

        let report = r#"{"streams": [
            {"codec_type": "video", "width": 64, "height": 48, "r_frame_rate": "30/?"}
        ]}"#;
        let info = parse_probe_output(report.as_bytes()).unwrap();
        assert_eq!(info.frame_rate, 30);
    }

    #[test]
    fn empty_buffer_fails_before_spawning() {
        let config = DecoderConfig {
            ffprobe_program: "/nonexistent/ffprobe".into(),
            ..DecoderConfig::default()
        };
        let err = probe(&[], &config).unwrap_err();
        assert!(matches!(err, DecodeError::ProbeParse { .. }));
    }

    #[test]
    fn missing_ffprobe_is_a_probe_spawn_failure() {
        let config = DecoderConfig {
            ffprobe_program: "/nonexistent/ffprobe".into(),
            ..DecoderConfig::default()
        };
        let err = probe(b"\x1a\x45\xdf\xa3", &config).unwrap_err();
        assert!(matches!(err, DecodeError::Spawn { phase: Phase::Probe, .. }));
    }
}
