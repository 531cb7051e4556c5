//! Writes the compressed payload into a subprocess's stdin.
//!
//! Feeding always runs on its own thread so the caller can drain stdout at the
//! same time; with both pipes bounded, writing everything up front would
//! deadlock as soon as the decoder's output pipe fills.

use std::{
    io::{self, Write},
    process::ChildStdin,
    sync::Arc,
    thread::{JoinHandle, Scope, ScopedJoinHandle},
};

use tracing::debug;

use crate::threads::{spawn_scoped, spawn_thread};

const FEED_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The whole payload was written and the input closed.
    Completed { written: usize },
    /// The process closed its stdin first; the rest of the payload was dropped.
    PeerClosed { written: usize },
}

/// Write all of `payload` into `input`, then close it by dropping.
///
/// A peer that already closed its end is not an error: a process that stopped
/// reading will not produce output for the unwritten bytes either. Every other
/// write failure is returned.
pub fn feed<W: Write>(mut input: W, payload: &[u8]) -> io::Result<FeedOutcome> {
    let mut written = 0;
    while written < payload.len() {
        let end = payload.len().min(written + FEED_CHUNK_BYTES);
        match input.write(&payload[written..end]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if is_peer_closed(&err) => {
                debug!(written, total = payload.len(), "subprocess closed stdin early: {err}");
                return Ok(FeedOutcome::PeerClosed { written });
            }
            Err(err) => return Err(err),
        }
    }
    match input.flush() {
        Ok(()) => {}
        Err(err) if is_peer_closed(&err) => {
            debug!(written, "subprocess closed stdin before flush: {err}");
            return Ok(FeedOutcome::PeerClosed { written });
        }
        Err(err) => return Err(err),
    }
    drop(input);
    Ok(FeedOutcome::Completed { written })
}

fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

/// Feed `payload` on a scoped thread borrowing the caller's buffer.
pub(crate) fn spawn_scoped_feeder<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    input: ChildStdin,
    payload: &'scope [u8],
) -> io::Result<ScopedJoinHandle<'scope, io::Result<FeedOutcome>>> {
    spawn_scoped(scope, "webm-feeder", move || feed(input, payload))
}

/// Feed an owned payload on a detached thread.
pub(crate) fn spawn_feeder(
    input: ChildStdin,
    payload: Arc<[u8]>,
) -> io::Result<JoinHandle<io::Result<FeedOutcome>>> {
    spawn_thread("webm-feeder", move || feed(input, &payload))
}
