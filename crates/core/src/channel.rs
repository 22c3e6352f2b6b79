//! Bounded frame channel linking pipeline stages.
//!
//! A thin layer over `tokio::sync::mpsc::channel` that adds an explicit
//! end-of-stream sentinel. Stage threads use the blocking halves; the channel
//! must not be driven from inside an async task.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::PipelineError;
use crate::types::Frame;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug)]
pub struct IndexedFrame {
    pub index: u64,
    pub frame: Frame,
}

impl IndexedFrame {
    pub fn new(index: u64, frame: Frame) -> Self {
        Self { index, frame }
    }
}

enum Message {
    Frame(IndexedFrame),
    EndOfStream,
}

/// The consumer side went away; the producer should stop.
#[derive(Debug, Error)]
#[error("{0} channel closed by its consumer")]
pub struct ChannelClosed(pub &'static str);

pub struct FrameSender {
    tx: mpsc::Sender<Message>,
    label: &'static str,
}

pub struct FrameReceiver {
    rx: mpsc::Receiver<Message>,
    label: &'static str,
    ended: bool,
}

/// Create a channel holding at most `capacity` frames (minimum 1).
pub fn frame_channel(label: &'static str, capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FrameSender { tx, label },
        FrameReceiver {
            rx,
            label,
            ended: false,
        },
    )
}

impl FrameSender {
    /// Blocks while the channel is full.
    pub fn put(&self, frame: IndexedFrame) -> Result<(), ChannelClosed> {
        self.tx
            .blocking_send(Message::Frame(frame))
            .map_err(|_| ChannelClosed(self.label))
    }

    /// Send the end-of-stream sentinel. Consumes the sender so it can only
    /// happen once.
    pub fn close(self) -> Result<(), ChannelClosed> {
        self.tx
            .blocking_send(Message::EndOfStream)
            .map_err(|_| ChannelClosed(self.label))
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl FrameReceiver {
    /// Blocks until a frame or the sentinel arrives. Returns `Ok(None)` once the
    /// sentinel has been seen. A producer that disappears without sending the
    /// sentinel is reported as a stream failure rather than a clean end.
    pub fn get(&mut self) -> Result<Option<IndexedFrame>, PipelineError> {
        if self.ended {
            return Ok(None);
        }

        match self.rx.blocking_recv() {
            Some(Message::Frame(frame)) => Ok(Some(frame)),
            Some(Message::EndOfStream) => {
                self.ended = true;
                self.rx.close();
                Ok(None)
            }
            None => {
                self.ended = true;
                Err(PipelineError::stream_io(
                    self.label,
                    "producer exited without end-of-stream marker",
                ))
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn frame(value: u8) -> Frame {
        Frame::filled(1, 1, 3, value)
    }

    #[test]
    fn test_frames_arrive_in_order_then_sentinel() {
        let (tx, mut rx) = frame_channel("read", 4);
        let producer = thread::spawn(move || {
            for i in 0..10u8 {
                tx.put(IndexedFrame::new(i as u64, frame(i)))
                    .expect("consumer alive");
            }
            tx.close().expect("consumer alive");
        });

        let mut seen = Vec::new();
        while let Some(item) = rx.get().expect("clean stream") {
            seen.push(item.frame.data()[0]);
        }
        producer.join().expect("producer thread");

        assert_eq!(seen, (0..10).collect::<Vec<u8>>());
        assert!(rx.is_ended());
        assert!(rx.get().expect("still clean").is_none());
    }

    #[test]
    fn test_capacity_bounds_producer_lead() {
        let (tx, mut rx) = frame_channel("write", 2);
        let produced = Arc::new(AtomicUsize::new(0));
        let consumed = Arc::new(AtomicUsize::new(0));
        let max_lead = Arc::new(AtomicUsize::new(0));

        let producer = {
            let produced = produced.clone();
            let consumed = consumed.clone();
            let max_lead = max_lead.clone();
            thread::spawn(move || {
                for i in 0..30u64 {
                    tx.put(IndexedFrame::new(i, frame(0))).expect("consumer alive");
                    let lead = produced.fetch_add(1, Ordering::SeqCst) + 1
                        - consumed.load(Ordering::SeqCst);
                    max_lead.fetch_max(lead, Ordering::SeqCst);
                }
                tx.close().expect("consumer alive");
            })
        };

        while rx.get().expect("clean stream").is_some() {
            thread::sleep(Duration::from_millis(2));
            consumed.fetch_add(1, Ordering::SeqCst);
        }
        producer.join().expect("producer thread");

        let observed = max_lead.load(Ordering::SeqCst);
        assert!(observed <= 4, "producer ran ahead by {observed} frames");
    }

    #[test]
    fn test_missing_sentinel_is_stream_error() {
        let (tx, mut rx) = frame_channel("read", 1);
        drop(tx);
        let err = rx.get().expect_err("dropped producer is not a clean end");
        assert!(matches!(err, PipelineError::StreamIo { stage: "read", .. }));
    }

    #[test]
    fn test_put_after_consumer_exit_reports_closed() {
        let (tx, rx) = frame_channel("write", 1);
        drop(rx);
        let err = tx
            .put(IndexedFrame::new(0, frame(1)))
            .expect_err("no consumer");
        assert_eq!(err.to_string(), "write channel closed by its consumer");
    }
}
