//! Destinations for acquired frames.

use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receives frames from the engine worker in sequence order.
///
/// `publish` returns `false` to stop the exposure early.
pub trait FrameSink: Send + Sync {
    fn publish(&self, frame: Frame) -> bool;
}

impl<F> FrameSink for F
where
    F: Fn(Frame) -> bool + Send + Sync,
{
    fn publish(&self, frame: Frame) -> bool {
        self(frame)
    }
}

/// Fan frames out to any number of subscribers.
///
/// Slow subscribers lag and lose frames; the exposure itself never blocks on them.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<Frame>>,
}

impl BroadcastSink {
    /// Channel holding up to `capacity` frames per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every frame published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(16)
    }
}

impl FrameSink for BroadcastSink {
    fn publish(&self, frame: Frame) -> bool {
        // No receivers is fine: frames are dropped.
        let _ = self.tx.send(Arc::new(frame));
        true
    }
}

/// Keep frames in memory, optionally refusing once `limit` is reached.
#[derive(Debug, Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<Frame>>,
    limit: Option<usize>,
}

impl CollectingSink {
    /// Accept every frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `limit` frames, then ask the engine to stop.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            limit: Some(limit),
        }
    }

    /// Number of stored frames.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// True when no frame is stored.
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Remove and return the stored frames.
    pub fn take(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Sequence numbers of the stored frames, in arrival order.
    pub fn sequence_numbers(&self) -> Vec<u64> {
        self.frames
            .lock()
            .iter()
            .map(|f| f.descriptor.sequence_number)
            .collect()
    }
}

impl FrameSink for CollectingSink {
    fn publish(&self, frame: Frame) -> bool {
        let mut frames = self.frames.lock();
        frames.push(frame);
        self.limit.map_or(true, |limit| frames.len() < limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDescriptor, PixelData};

    fn frame(sequence_number: u64) -> Frame {
        Frame {
            descriptor: FrameDescriptor {
                sequence_number,
                width: 1,
                height: 1,
                bit_depth: 16,
            },
            pixels: PixelData::U16(vec![0]),
        }
    }

    #[test]
    fn collecting_sink_refuses_past_limit() {
        let sink = CollectingSink::with_limit(2);
        assert!(sink.publish(frame(0)));
        assert!(!sink.publish(frame(1)));
        assert_eq!(sink.sequence_numbers(), vec![0, 1]);
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::default();
        assert!(sink.publish(frame(0)));

        let mut rx = sink.subscribe();
        assert!(sink.publish(frame(1)));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.descriptor.sequence_number, 1);
    }
}
