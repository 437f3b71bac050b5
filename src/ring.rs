// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// State shared between the two ends of a stream ring.
struct RingShared {
    channels: usize,
    capacity_frames: usize,
    /// Producer reached end of source; consuming the remaining frames is the
    /// natural end of the track.
    eof: AtomicBool,
    /// Consumer-side count of pop deficits.
    underruns: AtomicU64,
    /// Set while the consumer is starved, cleared once a pop is satisfied.
    starving: AtomicBool,
    /// Handshake for seeks: the producer publishes the serial it has seeked
    /// to, the consumer acknowledges after discarding stale frames.
    loader_serial: AtomicU64,
    flushed_serial: AtomicU64,
}

/// Creates a bounded SPSC frame ring. The producer end goes to the loader
/// thread, the consumer end to the mixer. Frames are interleaved; partial
/// frames never cross the boundary.
pub fn stream_ring(capacity_frames: usize, channels: u16) -> (StreamProducer, StreamConsumer) {
    let channels = channels as usize;
    let rb = HeapRb::<f32>::new(capacity_frames * channels);
    let (prod, cons) = rb.split();
    let shared = Arc::new(RingShared {
        channels,
        capacity_frames,
        eof: AtomicBool::new(false),
        underruns: AtomicU64::new(0),
        starving: AtomicBool::new(false),
        loader_serial: AtomicU64::new(0),
        flushed_serial: AtomicU64::new(0),
    });
    (
        StreamProducer {
            prod,
            shared: shared.clone(),
        },
        StreamConsumer { cons, shared },
    )
}

/// The loader-thread end of a stream ring.
pub struct StreamProducer {
    prod: HeapProd<f32>,
    shared: Arc<RingShared>,
}

impl StreamProducer {
    /// Pushes whole frames, returning how many were written (less than
    /// requested when the ring is full).
    pub fn push_frames(&mut self, frames: &[f32]) -> usize {
        let channels = self.shared.channels;
        let writable = self.prod.vacant_len() / channels;
        let take = writable.min(frames.len() / channels);
        if take == 0 {
            return 0;
        }
        let pushed = self.prod.push_slice(&frames[..take * channels]);
        debug_assert_eq!(pushed, take * channels);
        pushed / channels
    }

    /// Frames that can currently be pushed without blocking.
    pub fn free_frames(&self) -> usize {
        self.prod.vacant_len() / self.shared.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.shared.capacity_frames
    }

    /// Marks the end of the source. The consumer treats draining the ring
    /// after this point as the natural end of the track.
    pub fn mark_eof(&self) {
        self.shared.eof.store(true, Ordering::Release);
    }

    pub fn clear_eof(&self) {
        self.shared.eof.store(false, Ordering::Release);
    }

    /// Publishes the seek serial this producer has caught up to.
    pub fn publish_serial(&self, serial: u64) {
        self.shared.loader_serial.store(serial, Ordering::Release);
    }

    /// Returns true once the consumer has acknowledged the given serial by
    /// flushing stale frames.
    pub fn serial_flushed(&self, serial: u64) -> bool {
        self.shared.flushed_serial.load(Ordering::Acquire) >= serial
    }
}

/// The mixer end of a stream ring. Popping never blocks.
pub struct StreamConsumer {
    cons: HeapCons<f32>,
    shared: Arc<RingShared>,
}

impl StreamConsumer {
    /// Pops up to `max_frames` whole frames into `out`, returning the number
    /// of frames read. Does not count underruns; the caller decides whether a
    /// short read is an underrun or end-of-stream.
    pub fn pop_frames(&mut self, out: &mut [f32], max_frames: usize) -> usize {
        let channels = self.shared.channels;
        let readable = self.cons.occupied_len() / channels;
        let take = readable.min(max_frames);
        if take == 0 {
            return 0;
        }
        let popped = self.cons.pop_slice(&mut out[..take * channels]);
        debug_assert_eq!(popped, take * channels);
        self.shared.starving.store(false, Ordering::Relaxed);
        popped / channels
    }

    /// Frames currently buffered.
    pub fn buffered_frames(&self) -> usize {
        self.cons.occupied_len() / self.shared.channels
    }

    /// True once the producer has marked end of source.
    pub fn is_eof(&self) -> bool {
        self.shared.eof.load(Ordering::Acquire)
    }

    /// Records a pop deficit. Returns the running underrun count.
    pub fn record_underrun(&self) -> u64 {
        self.shared.starving.store(true, Ordering::Relaxed);
        self.shared.underruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    pub fn is_starving(&self) -> bool {
        self.shared.starving.load(Ordering::Relaxed)
    }

    /// Seek handshake: once the producer has published `serial`, discards
    /// everything buffered (it predates the seek) and acknowledges. Returns
    /// true when the flush has happened and post-seek data is flowing.
    pub fn flush_for_serial(&mut self, serial: u64) -> bool {
        if self.shared.loader_serial.load(Ordering::Acquire) < serial {
            return false;
        }
        if self.shared.flushed_serial.load(Ordering::Acquire) >= serial {
            return true;
        }
        self.cons.clear();
        self.shared.flushed_serial.store(serial, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_push_pop_roundtrip() {
        let (mut prod, mut cons) = stream_ring(8, 2);
        let frames: Vec<f32> = (0..12).map(|i| i as f32).collect(); // 6 stereo frames
        assert_eq!(prod.push_frames(&frames), 6);
        assert_eq!(cons.buffered_frames(), 6);

        let mut out = vec![0.0f32; 12];
        assert_eq!(cons.pop_frames(&mut out, 6), 6);
        assert_eq!(out, frames);
        assert_eq!(cons.buffered_frames(), 0);
    }

    #[test]
    fn test_partial_push_when_full() {
        let (mut prod, _cons) = stream_ring(4, 1);
        let frames = vec![1.0f32; 10];
        assert_eq!(prod.push_frames(&frames), 4);
        assert_eq!(prod.free_frames(), 0);
        assert_eq!(prod.push_frames(&frames), 0);
    }

    #[test]
    fn test_partial_pop_when_empty() {
        let (mut prod, mut cons) = stream_ring(8, 1);
        prod.push_frames(&[1.0, 2.0, 3.0]);

        let mut out = vec![0.0f32; 8];
        assert_eq!(cons.pop_frames(&mut out, 8), 3);
        assert_eq!(cons.pop_frames(&mut out, 8), 0);
    }

    #[test]
    fn test_underrun_accounting() {
        let (_prod, cons) = stream_ring(8, 1);
        assert_eq!(cons.underruns(), 0);
        assert!(!cons.is_starving());
        assert_eq!(cons.record_underrun(), 1);
        assert_eq!(cons.record_underrun(), 2);
        assert!(cons.is_starving());
        assert_eq!(cons.underruns(), 2);
    }

    #[test]
    fn test_eof_marker() {
        let (mut prod, mut cons) = stream_ring(8, 1);
        prod.push_frames(&[1.0, 2.0]);
        prod.mark_eof();

        assert!(cons.is_eof());
        let mut out = vec![0.0f32; 4];
        // Remaining frames still drain after EOF.
        assert_eq!(cons.pop_frames(&mut out, 4), 2);
    }

    #[test]
    fn test_seek_flush_handshake() {
        let (mut prod, mut cons) = stream_ring(8, 1);
        prod.push_frames(&[1.0, 2.0, 3.0]);

        // Consumer cannot flush until the producer reaches the serial.
        assert!(!cons.flush_for_serial(1));
        assert_eq!(cons.buffered_frames(), 3);

        prod.publish_serial(1);
        assert!(cons.flush_for_serial(1));
        assert_eq!(cons.buffered_frames(), 0);
        assert!(prod.serial_flushed(1));

        // Data pushed after the flush is post-seek and survives.
        prod.push_frames(&[9.0]);
        assert!(cons.flush_for_serial(1));
        assert_eq!(cons.buffered_frames(), 1);
    }

    #[test]
    fn test_threaded_frame_integrity() {
        // A writer and reader hammering the ring must never tear frames:
        // every popped frame holds (n, -n).
        let (mut prod, mut cons) = stream_ring(64, 2);
        let total = 10_000u32;

        let writer = thread::spawn(move || {
            let mut n = 0u32;
            while n < total {
                let frame = [n as f32, -(n as f32)];
                if prod.push_frames(&frame) == 1 {
                    n += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let mut out = vec![0.0f32; 2];
        let mut expect = 0u32;
        while expect < total {
            if cons.pop_frames(&mut out, 1) == 1 {
                assert_eq!(out[0], expect as f32);
                assert_eq!(out[1], -(expect as f32));
                expect += 1;
            } else {
                thread::yield_now();
            }
        }
        writer.join().unwrap();
    }
}
