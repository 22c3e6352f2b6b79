//! ffmpeg/ffprobe subprocess plumbing for raw frame streams.

pub mod video_input;
pub mod video_output;

use std::io::{BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};

use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub(crate) enum StderrTarget {
    Decoder,
    Encoder,
}

/// Drain a child's stderr line by line into a tracing target so the pipe
/// never fills up and blocks the child.
pub(crate) fn spawn_stderr_drain<R>(stderr: R, target: StderrTarget) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match (line, target) {
                (Ok(line), _) if line.is_empty() => {}
                (Ok(line), StderrTarget::Decoder) => debug!(target: "ffmpeg_stderr", "{}", line),
                (Ok(line), StderrTarget::Encoder) => {
                    debug!(target: "ffmpeg_encode_stderr", "{}", line)
                }
                (Err(e), _) => {
                    debug!(target: "ffmpeg_stderr", "read error: {}", e);
                    break;
                }
            }
        }
    })
}
