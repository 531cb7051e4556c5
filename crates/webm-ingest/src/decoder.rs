//! Orchestrates probe → spawn → feed ‖ read → reap for one buffer.
//!
//! Each call owns a private ffmpeg process, its pipes and its worker threads,
//! so independent calls can run in parallel without sharing state. Within a
//! call the feeder, the stderr drain and a watchdog live in one thread scope;
//! the watchdog enforces the optional deadline and caller cancellation by
//! killing the process, which unblocks both the reader and the feeder.

use std::{
    io,
    process::{ChildStdin, ChildStdout, Command, ExitStatus},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use tracing::{debug, field, info_span, warn};

use crate::{
    config::DecoderConfig,
    feeder::{FeedOutcome, spawn_feeder, spawn_scoped_feeder},
    probe,
    process::{ProcessHandle, ProcessKiller, StderrTail},
    reader::FrameReader,
    threads::{spawn_scoped, spawn_thread},
    types::{
        DecodeError, DecodedVideo, DecoderDiagnostics, Frame, FrameFormat, Phase, VideoStreamInfo,
    },
};

/// How often the watchdog checks the deadline and cancellation flag.
const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Frames buffered between the reader thread and a [`FrameStream`] consumer.
const STREAM_QUEUE_FRAMES: usize = 4;

/// Shared flag letting another thread abort an in-flight decode.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Why the watchdog killed the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Abort {
    TimedOut,
    Cancelled,
}

/// Frames delivered incrementally by [`Decoder::decode_stream`].
pub struct FrameStream {
    pub info: VideoStreamInfo,
    /// Yields frames in decode order; closes after end-of-stream or the first error.
    pub frames: Receiver<Result<Frame, DecodeError>>,
}

/// Decodes in-memory WebM/VP9 buffers with an external ffmpeg process.
#[derive(Clone, Debug, Default)]
pub struct Decoder {
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Discover the stream parameters of `buffer` without decoding it.
    pub fn probe(&self, buffer: &[u8]) -> Result<VideoStreamInfo, DecodeError> {
        probe::probe(buffer, &self.config)
    }

    /// Decode every frame of `buffer`.
    pub fn decode(&self, buffer: &[u8]) -> Result<DecodedVideo, DecodeError> {
        self.decode_with_cancel(buffer, &CancelToken::new())
    }

    /// Like [`Decoder::decode`], aborting with [`DecodeError::Cancelled`] once
    /// `cancel` is triggered.
    pub fn decode_with_cancel(
        &self,
        buffer: &[u8],
        cancel: &CancelToken,
    ) -> Result<DecodedVideo, DecodeError> {
        let span = info_span!(
            "webm.decode",
            bytes = buffer.len(),
            width = field::Empty,
            height = field::Empty,
            frame_rate = field::Empty,
            frames = field::Empty,
        );
        let _span_guard = span.enter();

        let info = self.probe(buffer)?;
        span.record("width", info.width);
        span.record("height", info.height);
        span.record("frame_rate", info.frame_rate);

        let started = Instant::now();
        let deadline = self.config.decode_timeout.map(|timeout| started + timeout);
        let mut process = self.spawn_decoder()?;
        let program = process.program().to_string();
        let (stdin, stdout) = take_pipes(&mut process)?;
        let stderr = process.stderr_tail();
        let killer = process.killer();

        let run = thread::scope(|scope| -> Result<ScopedRun, DecodeError> {
            let (done_tx, done_rx) = bounded::<()>(1);
            let watchdog_killer = killer.clone();
            let watchdog_cancel = cancel.clone();
            let watchdog = spawn_scoped(scope, "webm-watchdog", move || {
                watch(done_rx, &watchdog_killer, deadline, &watchdog_cancel)
            })
            .map_err(|source| spawn_io_error(&program, source))?;
            let feeder = spawn_scoped_feeder(scope, stdin, buffer)
                .map_err(|source| spawn_io_error(&program, source))?;

            let frames = FrameReader::new(stdout, &info)
                .with_source(program.clone(), stderr.clone())
                .read_all();
            if frames.is_err() {
                // Nothing more will be read; stop the decoder so the feeder unblocks.
                killer.kill();
            }
            // The output is settled; a later deadline or cancel must not undo it.
            drop(done_tx);
            let abort = watchdog.join().unwrap_or(None);

            let status = process.wait_until(deadline);
            let fed = feeder
                .join()
                .map_err(|_| DecodeError::Other(anyhow!("feeder thread panicked")))?;

            Ok(ScopedRun {
                frames,
                fed,
                status,
                abort,
            })
        })?;

        if let Some(abort) = run.abort {
            return Err(match abort {
                Abort::TimedOut => DecodeError::DecodeTimeout {
                    timeout: self.config.decode_timeout.unwrap_or_default(),
                    stderr: stderr.snapshot(),
                },
                Abort::Cancelled => DecodeError::Cancelled,
            });
        }
        // The stderr drain has been joined by the reap, so the tail is complete now.
        let frames = run.frames.map_err(|err| err.with_stderr(stderr.snapshot()))?;
        match run.fed {
            Ok(FeedOutcome::Completed { written }) => debug!(written, "input fully written"),
            Ok(FeedOutcome::PeerClosed { written }) => {
                debug!(written, "decoder stopped reading input early")
            }
            Err(err) => return Err(DecodeError::FeedFailed(err)),
        }
        let status = run.status?;
        if status.is_none() {
            warn!("{program} kept running after its output ended; killed at the deadline");
        }
        let decoder_diagnostics = exit_diagnostics(&program, status, &stderr);

        span.record("frames", frames.len());
        debug!(
            frames = frames.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "decode complete"
        );
        Ok(DecodedVideo {
            info,
            frames,
            decoder_diagnostics,
        })
    }

    /// Probe `buffer`, then decode it on background threads, delivering frames
    /// through a bounded channel as they are read.
    ///
    /// Dropping the receiver stops the decoder. The configured decode timeout
    /// does not apply; the consumer controls the pace.
    pub fn decode_stream(&self, buffer: impl Into<Arc<[u8]>>) -> Result<FrameStream, DecodeError> {
        let buffer: Arc<[u8]> = buffer.into();
        let info = self.probe(&buffer)?;

        let mut process = self.spawn_decoder()?;
        let program = process.program().to_string();
        let (stdin, stdout) = take_pipes(&mut process)?;
        let stderr = process.stderr_tail();
        let killer = process.killer();

        let feeder =
            spawn_feeder(stdin, buffer).map_err(|source| spawn_io_error(&program, source))?;
        let (tx, rx) = bounded(STREAM_QUEUE_FRAMES);
        let reader = FrameReader::new(stdout, &info).with_source(program.clone(), stderr.clone());

        spawn_thread("webm-frame-reader", move || {
            let mut failure = None;
            for frame in reader {
                match frame {
                    Ok(frame) => {
                        if tx.send(Ok(frame)).is_err() {
                            debug!("frame receiver dropped; stopping decoder");
                            killer.kill();
                            break;
                        }
                    }
                    Err(err) => {
                        killer.kill();
                        failure = Some(err);
                        break;
                    }
                }
            }
            let fed = feeder.join();
            let status = match process.wait_until(None) {
                Ok(status) => status,
                Err(err) => {
                    warn!("failed to reap {program}: {err}");
                    None
                }
            };
            if let Some(err) = failure {
                let _ = tx.send(Err(err.with_stderr(stderr.snapshot())));
                return;
            }
            match fed {
                Ok(Err(err)) => {
                    let _ = tx.send(Err(DecodeError::FeedFailed(err)));
                    return;
                }
                Err(_) => warn!("feeder thread panicked"),
                Ok(Ok(_)) => {}
            }
            exit_diagnostics(&program, status, &stderr);
        })
        .map_err(|source| DecodeError::Io {
            phase: Phase::Decode,
            program: "webm-frame-reader".into(),
            source,
        })?;

        Ok(FrameStream { info, frames: rx })
    }

    fn spawn_decoder(&self) -> Result<ProcessHandle, DecodeError> {
        ProcessHandle::spawn(
            decoder_command(&self.config),
            Phase::Decode,
            self.config.stderr_capacity,
        )
    }
}

/// Decode `buffer` with the default configuration.
pub fn decode(buffer: &[u8]) -> Result<DecodedVideo, DecodeError> {
    Decoder::default().decode(buffer)
}

/// ffmpeg invocation reading a WebM bitstream on stdin and writing raw BGRA
/// frames to stdout. Resolution and frame rate come from the bitstream itself.
pub(crate) fn decoder_command(config: &DecoderConfig) -> Command {
    let mut cmd = Command::new(&config.ffmpeg_program);
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-c:v")
        .arg(&config.input_codec)
        .arg("-i")
        .arg("pipe:")
        .arg("-an")
        .arg("-f")
        .arg("rawvideo")
        .arg("-pix_fmt")
        .arg(FrameFormat::Bgra8.ffmpeg_name())
        .arg("pipe:");
    cmd
}

struct ScopedRun {
    frames: Result<Vec<Frame>, DecodeError>,
    fed: io::Result<FeedOutcome>,
    /// `None` when the reap deadline passed and the process was killed.
    status: Result<Option<ExitStatus>, DecodeError>,
    abort: Option<Abort>,
}

fn take_pipes(
    process: &mut ProcessHandle,
) -> Result<(ChildStdin, ChildStdout), DecodeError> {
    let stdin = process.take_stdin();
    let stdout = process.take_stdout();
    match (stdin, stdout) {
        (Some(stdin), Some(stdout)) => Ok((stdin, stdout)),
        _ => Err(DecodeError::Io {
            phase: Phase::Decode,
            program: process.program().to_string(),
            source: io::Error::other("decoder pipes were not captured"),
        }),
    }
}

fn spawn_io_error(program: &str, source: io::Error) -> DecodeError {
    DecodeError::Io {
        phase: Phase::Decode,
        program: program.to_string(),
        source,
    }
}

/// Kill the process once `deadline` passes or `cancel` fires. Returns when
/// `done` is signalled or dropped.
fn watch(
    done: Receiver<()>,
    killer: &ProcessKiller,
    deadline: Option<Instant>,
    cancel: &CancelToken,
) -> Option<Abort> {
    loop {
        match done.recv_timeout(WATCHDOG_POLL_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return None,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if cancel.is_cancelled() {
            debug!("decode cancelled; killing decoder");
            killer.kill();
            return Some(Abort::Cancelled);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!("decode deadline passed; killing decoder");
            killer.kill();
            return Some(Abort::TimedOut);
        }
    }
}

/// A non-zero exit after the output was drained is reported, not fatal.
/// `status` is `None` when the process had to be killed.
fn exit_diagnostics(
    program: &str,
    status: Option<ExitStatus>,
    stderr: &StderrTail,
) -> Option<DecoderDiagnostics> {
    if status.is_some_and(|status| status.success()) {
        return None;
    }
    let diagnostics = DecoderDiagnostics {
        exit_code: status.and_then(|status| status.code()),
        stderr: stderr.snapshot(),
    };
    warn!(
        exit_code = ?diagnostics.exit_code,
        "{program} exited unsuccessfully: {}",
        diagnostics.stderr
    );
    Some(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_command_requests_raw_bgra_from_stdin() {
        let config = DecoderConfig::default();
        let cmd = decoder_command(&config);
        assert_eq!(cmd.get_program(), "ffmpeg");
        let args: Vec<_> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libvpx-vp9 -i pipe:"));
        assert!(joined.ends_with("-f rawvideo -pix_fmt bgra pipe:"));
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = DecoderConfig {
            stderr_capacity: 0,
            ..DecoderConfig::default()
        };
        assert!(Decoder::new(config).is_err());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn empty_buffer_fails_in_probe_phase() {
        let err = Decoder::default().decode(&[]).unwrap_err();
        assert!(matches!(err, DecodeError::ProbeParse { .. }));
        assert_eq!(err.phase(), Phase::Probe);
    }

    #[cfg(unix)]
    #[test]
    fn watchdog_returns_when_done_is_dropped() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let process = ProcessHandle::spawn(cmd, Phase::Decode, 16).unwrap();
        let killer = process.killer();
        let (done_tx, done_rx) = bounded::<()>(1);
        drop(done_tx);
        assert_eq!(watch(done_rx, &killer, None, &CancelToken::new()), None);
        drop(process);
    }

    #[cfg(unix)]
    #[test]
    fn watchdog_kills_on_deadline_and_cancel() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let process = ProcessHandle::spawn(cmd, Phase::Decode, 16).unwrap();
        let (_done_tx, done_rx) = bounded::<()>(1);
        let abort = watch(
            done_rx,
            &process.killer(),
            Some(Instant::now() + Duration::from_millis(30)),
            &CancelToken::new(),
        );
        assert_eq!(abort, Some(Abort::TimedOut));
        assert!(process.wait().unwrap().code().is_none());

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let process = ProcessHandle::spawn(cmd, Phase::Decode, 16).unwrap();
        let (_done_tx, done_rx) = bounded::<()>(1);
        let cancel = CancelToken::new();
        cancel.cancel();
        let abort = watch(done_rx, &process.killer(), None, &cancel);
        assert_eq!(abort, Some(Abort::Cancelled));
        process.wait().unwrap();
    }

    #[test]
    fn killed_decoder_is_reported_without_exit_code() {
        let tail = StderrTail::new(64);
        tail.push(b"still flushing\n");
        let diagnostics = exit_diagnostics("ffmpeg", None, &tail).unwrap();
        assert_eq!(diagnostics.exit_code, None);
        assert_eq!(diagnostics.stderr, "still flushing");
    }

    #[cfg(unix)]
    #[test]
    fn clean_exit_has_no_diagnostics() {
        use std::os::unix::process::ExitStatusExt;

        let tail = StderrTail::new(64);
        assert!(exit_diagnostics("ffmpeg", Some(ExitStatus::from_raw(0)), &tail).is_none());
        let failed = exit_diagnostics("ffmpeg", Some(ExitStatus::from_raw(2 << 8)), &tail).unwrap();
        assert_eq!(failed.exit_code, Some(2));
    }
}
