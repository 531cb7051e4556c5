//! Command-line arguments for the `webm-ingest` binary.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use webm_ingest::{DEFAULT_STDERR_CAPACITY, DecoderConfig};

/// Decode a WebM/VP9 stream read from stdin and summarise its frames.
#[derive(Debug, Parser)]
#[command(name = "webm-ingest", version)]
pub struct CliArgs {
    /// ffmpeg executable used for decoding.
    #[arg(long = "ffmpeg", value_name = "PATH", default_value = "ffmpeg")]
    pub ffmpeg: String,
    /// ffprobe executable used for stream discovery.
    #[arg(long = "ffprobe", value_name = "PATH", default_value = "ffprobe")]
    pub ffprobe: String,
    /// Decoder passed to ffmpeg as the input `-c:v`.
    #[arg(long = "codec", value_name = "NAME", default_value = "libvpx-vp9")]
    pub codec: String,
    /// Abort the probe step after this many milliseconds.
    #[arg(long = "probe-timeout-ms", value_name = "MS")]
    pub probe_timeout_ms: Option<u64>,
    /// Abort decoding after this many milliseconds.
    #[arg(long = "decode-timeout-ms", value_name = "MS")]
    pub decode_timeout_ms: Option<u64>,
    /// Bytes of subprocess stderr retained for diagnostics.
    #[arg(long = "stderr-capacity", value_name = "BYTES", default_value_t = DEFAULT_STDERR_CAPACITY)]
    pub stderr_capacity: usize,
    /// Only probe the stream; skip decoding.
    #[arg(long = "probe-only", action = clap::ArgAction::SetTrue)]
    pub probe_only: bool,
    /// Print the summary as JSON.
    #[arg(long = "json", action = clap::ArgAction::SetTrue)]
    pub json: bool,
    /// Enable debug logging unless `RUST_LOG` says otherwise.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<&CliArgs> for DecoderConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CliArgs) -> Result<Self> {
        if args.probe_timeout_ms == Some(0) {
            bail!("--probe-timeout-ms must be greater than zero");
        }
        if args.decode_timeout_ms == Some(0) {
            bail!("--decode-timeout-ms must be greater than zero");
        }

        let config = DecoderConfig {
            ffmpeg_program: args.ffmpeg.clone(),
            ffprobe_program: args.ffprobe.clone(),
            input_codec: args.codec.clone(),
            probe_timeout: args.probe_timeout_ms.map(Duration::from_millis),
            decode_timeout: args.decode_timeout_ms.map(Duration::from_millis),
            stderr_capacity: args.stderr_capacity,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("webm-ingest").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_map_to_default_config() {
        let args = parse(&[]);
        let config = DecoderConfig::try_from(&args).unwrap();
        assert_eq!(config.ffmpeg_program, "ffmpeg");
        assert_eq!(config.ffprobe_program, "ffprobe");
        assert_eq!(config.input_codec, "libvpx-vp9");
        assert_eq!(config.stderr_capacity, DEFAULT_STDERR_CAPACITY);
        assert!(config.probe_timeout.is_none());
    }

    #[test]
    fn timeouts_are_milliseconds() {
        let args = parse(&["--probe-timeout-ms", "1500", "--decode-timeout-ms", "20"]);
        let config = DecoderConfig::try_from(&args).unwrap();
        assert_eq!(config.probe_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.decode_timeout, Some(Duration::from_millis(20)));
    }

    #[test]
    fn rejects_zero_timeout_and_capacity() {
        let args = parse(&["--decode-timeout-ms", "0"]);
        assert!(DecoderConfig::try_from(&args).is_err());

        let args = parse(&["--stderr-capacity", "0"]);
        assert!(DecoderConfig::try_from(&args).is_err());
    }
}
