//! Frame buffers and the capture → socket handoff queue
//!
//! The queue is single-producer single-consumer: the real-time capture
//! callback pushes, the serving thread pops. The producer side never blocks
//! and never loses the newest block; when the queue is full the oldest block
//! is evicted instead.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::AudioFormat;

/// One block of interleaved PCM16LE audio
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    data: Bytes,
    channels: u16,
    sequence: u32,
}

impl FrameBuffer {
    /// Wrap raw PCM16LE bytes. Any trailing partial frame is dropped.
    pub fn new(data: impl Into<Bytes>, channels: u16, sequence: u32) -> Self {
        let mut data: Bytes = data.into();
        let frame_bytes = channels.max(1) as usize * 2;
        let aligned = data.len() - data.len() % frame_bytes;
        data.truncate(aligned);
        Self {
            data,
            channels,
            sequence,
        }
    }

    /// Build a frame from interleaved i16 samples
    pub fn from_i16(samples: &[i16], channels: u16, sequence: u32) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self::new(data, channels, sequence)
    }

    /// Build a frame from interleaved float samples, clipping to [-1, 1]
    pub fn from_f32(samples: &[f32], channels: u16, sequence: u32) -> Self {
        Self::new(f32_to_pcm16(samples), channels, sequence)
    }

    /// A block of digital silence for `format`
    pub fn silence(format: &AudioFormat) -> Self {
        Self::new(vec![0u8; format.block_bytes()], format.channels, 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Frames (samples per channel) in this buffer
    pub fn frames(&self) -> usize {
        self.data.len() / (self.channels.max(1) as usize * 2)
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Convert one float sample to PCM16 by clipping and scaling by 32767
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Convert interleaved float samples to PCM16LE bytes
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }
    out
}

/// Bounded drop-oldest queue of frame buffers
pub struct BoundedFrameQueue {
    queue: ArrayQueue<FrameBuffer>,
    /// One-slot wakeup so the consumer can wait without the producer locking anything
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
    sequence: AtomicU32,
    overflow_count: AtomicUsize,
}

impl BoundedFrameQueue {
    /// Create a new queue with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(1);
        Self {
            queue: ArrayQueue::new(capacity),
            doorbell_tx,
            doorbell_rx,
            sequence: AtomicU32::new(0),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame, evicting the oldest one when full.
    /// Returns false if an older frame had to be dropped.
    pub fn push(&self, frame: FrameBuffer) -> bool {
        let evicted = self.queue.force_push(frame);
        let _ = self.doorbell_tx.try_send(());
        match evicted {
            Some(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => true,
        }
    }

    /// Copy PCM16LE bytes into a new frame stamped with the next sequence number and push it
    pub fn push_bytes(&self, data: &[u8], channels: u16) -> bool {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.push(FrameBuffer::new(Bytes::copy_from_slice(data), channels, seq))
    }

    /// Pop a frame without waiting
    pub fn try_pop(&self) -> Option<FrameBuffer> {
        self.queue.pop()
    }

    /// Pop a frame, waiting up to `timeout` for one to arrive
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FrameBuffer> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.queue.pop() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match self.doorbell_rx.recv_timeout(deadline - now) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) => return self.queue.pop(),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Drop everything currently queued, returning how many frames were discarded
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        let _ = self.doorbell_rx.try_recv();
        dropped
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get current queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Get queue capacity
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Frames evicted because the consumer fell behind
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a frame queue
pub type SharedFrameQueue = Arc<BoundedFrameQueue>;

/// Create a new shared frame queue
pub fn create_shared_queue(capacity: usize) -> SharedFrameQueue {
    Arc::new(BoundedFrameQueue::new(capacity))
}
