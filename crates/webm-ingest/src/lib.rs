//! Decode WebM/VP9 video held in memory into raw BGRA frames.
//!
//! The buffer is never written to disk. Stream parameters are discovered with
//! `ffprobe`, then the buffer is piped through an `ffmpeg` subprocess while
//! its raw output is split into fixed-size frames:
//!
//! - `probe`: ffprobe invocation and JSON report parsing.
//! - `process`: subprocess lifecycle and the bounded stderr tail.
//! - `feeder`: concurrent writer for the subprocess's stdin.
//! - `reader`: fixed-size frame reader for the subprocess's stdout.
//! - `decoder`: the orchestrator tying the stages together.

pub use config::{DEFAULT_STDERR_CAPACITY, DecoderConfig};
pub use decoder::{CancelToken, Decoder, FrameStream, decode};
pub use feeder::{FeedOutcome, feed};
pub use probe::{parse_frame_rate, parse_probe_output, probe};
pub use process::{ProcessHandle, ProcessKiller, StderrTail};
pub use reader::FrameReader;
pub use types::{
    BYTES_PER_PIXEL, DecodeError, DecodedVideo, DecoderDiagnostics, Frame, FrameFormat, Phase,
    VideoStreamInfo,
};

mod config;
mod decoder;
mod feeder;
mod probe;
mod process;
mod reader;
mod threads;
mod types;
