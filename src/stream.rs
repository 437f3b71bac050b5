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

//! Streaming loader: one background thread per streaming track prefetches
//! decoded frames into that track's ring so the audio callback does no
//! decoding or file I/O. The thread sleeps on a condition variable and wakes
//! for control signals (pause, seek, shutdown) or on a short timeout to poll
//! ring space, since the real-time consumer cannot notify it.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use crate::dsp::loudness;
use crate::events::EngineEvent;
use crate::ring::StreamProducer;
use crate::source::decode::FileStream;
use crate::track::TrackShared;

/// Frames decoded per refill read.
const CHUNK_FRAMES: usize = 1024;
/// How often the loader re-checks ring space while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How often the loader checks for the consumer's seek flush.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Observable loader lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoaderState {
    Loading = 0,
    Paused = 1,
    Ended = 2,
    Error = 3,
}

impl LoaderState {
    fn from_u8(value: u8) -> LoaderState {
        match value {
            1 => LoaderState::Paused,
            2 => LoaderState::Ended,
            3 => LoaderState::Error,
            _ => LoaderState::Loading,
        }
    }
}

#[derive(Default)]
struct LoaderFlags {
    paused: bool,
    shutdown: bool,
    /// Pending seek target in source frames.
    seek_frame: Option<u64>,
    /// Serial of the most recent seek request.
    seek_serial: u64,
}

/// Control block shared between the engine and one loader thread.
pub(crate) struct LoaderControl {
    flags: Mutex<LoaderFlags>,
    condvar: Condvar,
    state: AtomicU8,
    /// Fixed normalization gain decided during warmup.
    normalize_scalar: AtomicU32,
}

impl LoaderControl {
    fn new() -> LoaderControl {
        LoaderControl {
            flags: Mutex::new(LoaderFlags::default()),
            condvar: Condvar::new(),
            state: AtomicU8::new(LoaderState::Loading as u8),
            normalize_scalar: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn pause(&self) {
        let mut flags = self.flags.lock().expect("loader lock poisoned");
        flags.paused = true;
        self.condvar.notify_all();
    }

    pub fn resume(&self) {
        let mut flags = self.flags.lock().expect("loader lock poisoned");
        flags.paused = false;
        self.condvar.notify_all();
    }

    /// Requests a seek to the given source frame. Returns the serial the
    /// mixer must use to synchronize its ring flush.
    pub fn request_seek(&self, frame: u64) -> u64 {
        let mut flags = self.flags.lock().expect("loader lock poisoned");
        flags.seek_serial += 1;
        flags.seek_frame = Some(frame);
        self.condvar.notify_all();
        flags.seek_serial
    }

    pub fn shutdown(&self) {
        let mut flags = self.flags.lock().expect("loader lock poisoned");
        flags.shutdown = true;
        self.condvar.notify_all();
    }

    pub fn state(&self) -> LoaderState {
        LoaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The fixed gain applied to every streamed sample.
    pub fn normalize_scalar(&self) -> f32 {
        f32::from_bits(self.normalize_scalar.load(Ordering::Acquire))
    }

    fn publish_state(&self, state: LoaderState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Handle owned by the engine-side track entry.
pub(crate) struct LoaderHandle {
    pub control: Arc<LoaderControl>,
    join: Option<JoinHandle<()>>,
}

impl LoaderHandle {
    /// Signals shutdown and joins the loader thread.
    pub fn shutdown_and_join(&mut self) {
        self.control.shutdown();
        if let Some(handle) = self.join.take() {
            if handle.join().is_err() {
                error!("Loader thread panicked during join");
            }
        }
    }
}

impl Drop for LoaderHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Warms up the ring on the calling thread, then spawns the refill thread.
///
/// Auto-normalization measures the warmup window and fixes a scalar such that
/// its peak lands near full scale; the scalar then applies to the whole
/// stream.
pub(crate) fn spawn_loader(
    mut stream: FileStream,
    mut producer: StreamProducer,
    shared: Arc<TrackShared>,
    event_tx: Sender<EngineEvent>,
    auto_normalize: bool,
) -> std::io::Result<LoaderHandle> {
    let control = Arc::new(LoaderControl::new());

    // Warmup: fill half the ring before the track becomes playable.
    let warmup_target = producer.capacity_frames() / 2;
    let channels = stream.channels() as usize;
    let mut warmup: Vec<f32> = Vec::with_capacity(warmup_target * channels);
    let mut chunk = Vec::new();
    while warmup.len() / channels < warmup_target {
        let left = warmup_target - warmup.len() / channels;
        match stream.next_chunk(&mut chunk, left.min(CHUNK_FRAMES)) {
            Ok(0) => break,
            Ok(_) => warmup.extend_from_slice(&chunk),
            Err(e) => {
                return Err(std::io::Error::other(format!(
                    "stream warmup failed: {}",
                    e
                )))
            }
        }
    }

    let scalar = if auto_normalize {
        let peak = loudness::peak(&warmup);
        if peak > f32::EPSILON {
            0.95 / peak
        } else {
            1.0
        }
    } else {
        1.0
    };
    if scalar != 1.0 {
        for sample in &mut warmup {
            *sample *= scalar;
        }
        control
            .normalize_scalar
            .store(scalar.to_bits(), Ordering::Release);
    }

    producer.push_frames(&warmup);
    if stream.is_finished() {
        producer.mark_eof();
    }
    info!(
        track = shared.id.as_str(),
        warmup_frames = warmup.len() / channels,
        scalar,
        "Streaming track warmed up."
    );

    let thread_control = control.clone();
    let join = thread::Builder::new()
        .name(format!("rtmix-loader-{}", shared.id))
        .spawn(move || {
            loader_thread(stream, producer, shared, thread_control, event_tx, scalar);
        })?;

    Ok(LoaderHandle {
        control,
        join: Some(join),
    })
}

fn loader_thread(
    mut stream: FileStream,
    mut producer: StreamProducer,
    shared: Arc<TrackShared>,
    control: Arc<LoaderControl>,
    event_tx: Sender<EngineEvent>,
    scalar: f32,
) {
    // Refill once the ring has this much free space.
    let capacity = producer.capacity_frames();
    let refill_threshold = (capacity / 4).max(CHUNK_FRAMES).min(capacity / 2).max(1);
    let mut chunk: Vec<f32> = Vec::with_capacity(CHUNK_FRAMES * stream.channels() as usize);
    let mut source_ended = stream.is_finished();

    loop {
        // Park until there is work: a control signal or ring space.
        let seek = {
            let mut flags = control.flags.lock().expect("loader lock poisoned");
            loop {
                if flags.shutdown {
                    debug!(track = shared.id.as_str(), "Loader shutting down.");
                    return;
                }
                if flags.seek_frame.is_some() {
                    break;
                }
                let wants_refill =
                    !flags.paused && !source_ended && producer.free_frames() >= refill_threshold;
                if wants_refill {
                    break;
                }
                if flags.paused {
                    control.publish_state(LoaderState::Paused);
                } else if source_ended && control.state() == LoaderState::Loading {
                    control.publish_state(LoaderState::Ended);
                }
                let (guard, _timeout) = control
                    .condvar
                    .wait_timeout(flags, POLL_INTERVAL)
                    .expect("loader lock poisoned");
                flags = guard;
            }
            flags.seek_frame.take().map(|frame| (frame, flags.seek_serial))
        };

        if let Some((frame, serial)) = seek {
            match stream.seek_to_frame(frame) {
                Ok(()) => {
                    source_ended = false;
                    producer.clear_eof();
                    producer.publish_serial(serial);
                    // Wait for the mixer to discard pre-seek frames before
                    // pushing fresh ones, so the seek boundary stays clean. A
                    // newer seek request supersedes this one; the flush will
                    // happen against its serial instead.
                    loop {
                        if producer.serial_flushed(serial) {
                            break;
                        }
                        let flags = control.flags.lock().expect("loader lock poisoned");
                        if flags.shutdown {
                            return;
                        }
                        if flags.seek_frame.is_some() {
                            break;
                        }
                        drop(flags);
                        thread::sleep(FLUSH_POLL_INTERVAL);
                    }
                    control.publish_state(LoaderState::Loading);
                    debug!(track = shared.id.as_str(), frame, "Loader seeked.");
                }
                Err(e) => {
                    error!(track = shared.id.as_str(), err = e.to_string(), "Loader seek failed");
                    control.publish_state(LoaderState::Error);
                    producer.mark_eof();
                    let _ = event_tx.send(EngineEvent::StreamFailed {
                        track: shared.clone(),
                        reason: e.to_string(),
                    });
                    source_ended = true;
                }
            }
            continue;
        }

        control.publish_state(LoaderState::Loading);
        let target = producer.free_frames().min(CHUNK_FRAMES);
        match stream.next_chunk(&mut chunk, target) {
            Ok(0) => {
                if shared.looped() {
                    // Rewind-and-continue keeps the ring seamless across the
                    // loop point.
                    if let Err(e) = stream.seek_to_frame(0) {
                        error!(track = shared.id.as_str(), err = e.to_string(), "Loop rewind failed");
                        control.publish_state(LoaderState::Error);
                        producer.mark_eof();
                        let _ = event_tx.send(EngineEvent::StreamFailed {
                            track: shared.clone(),
                            reason: e.to_string(),
                        });
                        source_ended = true;
                    }
                } else {
                    producer.mark_eof();
                    source_ended = true;
                    debug!(track = shared.id.as_str(), "Loader reached end of source.");
                }
            }
            Ok(_) => {
                if scalar != 1.0 {
                    for sample in &mut chunk {
                        *sample *= scalar;
                    }
                }
                producer.push_frames(&chunk);
            }
            Err(e) => {
                error!(track = shared.id.as_str(), err = e.to_string(), "Streaming read failed");
                control.publish_state(LoaderState::Error);
                producer.mark_eof();
                let _ = event_tx.send(EngineEvent::StreamFailed {
                    track: shared.clone(),
                    reason: e.to_string(),
                });
                source_ended = true;
            }
        }
    }
}
