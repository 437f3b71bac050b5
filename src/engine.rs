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

//! The engine handle and its control plane.
//!
//! `AudioEngine` owns every track, the mix core, the output device, the
//! position watcher and the event dispatcher. All public operations are safe
//! to call concurrently with the audio callback and with each other: track
//! parameters travel through atomic slots, structural changes through the
//! command channel, and user callbacks are delivered from the dispatcher
//! thread, never from the audio thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::device::{self, OutputDevice};
use crate::dsp::channel;
use crate::dsp::loudness::{AnalyzerRegistry, LoudnessAnalyzer, LoudnessMethod};
use crate::dsp::resample::resample_hq;
use crate::error::EngineError;
use crate::events::{CompleteCallback, EngineEvent};
use crate::mixer::{ActiveSource, ActiveTrack, MixerCommand, MixerCore, MixerStats};
use crate::ring::stream_ring;
use crate::source::decode::{estimated_decoded_bytes, FileStream};
use crate::source::{Source, TrackData};
use crate::stream::{spawn_loader, LoaderHandle};
use crate::track::{
    TrackCounts, TrackInfo, TrackShared, MAX_SPEED, MAX_VOLUME, MIN_SPEED,
};
use crate::watcher::{
    spawn_watcher, GlobalListener, ListenerId, PositionCallbackStats, PositionHandler,
    WatcherShared,
};

/// Streams instead of preloads when the decoded size estimate exceeds this
/// and the caller asked for automatic selection.
const STREAM_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;
/// Auto-normalization scales the peak to this level.
const NORMALIZE_TARGET_PEAK: f32 = 0.95;
/// Default tolerance for position callbacks, in seconds.
pub const DEFAULT_POSITION_TOLERANCE: f64 = 0.010;

/// How a source should be brought into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Preload small sources, stream large files.
    #[default]
    Auto,
    /// Decode fully into memory.
    Preload,
    /// Stream from disk through a bounded ring.
    Stream,
}

/// Sample-rate conversion strategy for preloaded sources whose rate differs
/// from the engine rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleQuality {
    /// Keep the source rate; the mixer resamples per callback with the
    /// linear fast path.
    #[default]
    Realtime,
    /// Convert once at load time with the sinc resampler.
    High,
}

/// Options for load_track.
pub struct LoadOptions {
    /// Initial playback speed, 0.1 to 4.0.
    pub speed: f32,
    /// Scale the source so its peak lands near full scale.
    pub auto_normalize: bool,
    pub mode: LoadMode,
    pub resample_quality: ResampleQuality,
    /// Fired on natural end, stop and failures; see `CompleteCallback`.
    pub on_complete: Option<CompleteCallback>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            speed: 1.0,
            auto_normalize: true,
            mode: LoadMode::default(),
            resample_quality: ResampleQuality::default(),
            on_complete: None,
        }
    }
}

impl LoadOptions {
    pub fn new() -> LoadOptions {
        LoadOptions::default()
    }
}

/// Options for play.
#[derive(Default)]
pub struct PlayOptions {
    pub fade_in: bool,
    /// Some(_) overwrites the track's loop flag.
    pub looped: Option<bool>,
    /// Start position in seconds.
    pub seek: Option<f64>,
    /// Some(_) overwrites the track's target volume.
    pub volume: Option<f32>,
}

/// Options for crossfade.
pub struct CrossfadeOptions {
    /// Target volume for the incoming track; computed by loudness matching
    /// when omitted.
    pub to_volume: Option<f32>,
    pub to_loop: bool,
    pub loudness_method: LoudnessMethod,
}

impl Default for CrossfadeOptions {
    fn default() -> Self {
        CrossfadeOptions {
            to_volume: None,
            to_loop: false,
            loudness_method: LoudnessMethod::Rms,
        }
    }
}

/// Engine-level performance statistics.
#[derive(Debug, Clone)]
pub struct PerformanceStats {
    /// Smoothed callback time as a percentage of the callback period.
    pub cpu_usage: f32,
    /// Peak absolute sample of the last callback, measured pre-limiter.
    pub peak_level: f32,
    pub active_tracks: usize,
    pub total_tracks: usize,
    /// Total streaming underruns since start.
    pub underruns: u64,
}

/// Engine-side record for one loaded track.
struct TrackEntry {
    shared: Arc<TrackShared>,
    /// Preloaded PCM; also feeds loudness analysis. None for streams.
    data: Option<Arc<TrackData>>,
    loader: Mutex<Option<LoaderHandle>>,
    on_complete: Mutex<Option<CompleteCallback>>,
    /// Set when a stream failure was already reported, so the follow-up
    /// completion does not double-fire the callback.
    failure_reported: AtomicBool,
}

struct EngineShared {
    config: EngineConfig,
    tracks: RwLock<HashMap<String, Arc<TrackEntry>>>,
    watcher: Arc<WatcherShared>,
    analyzers: Mutex<AnalyzerRegistry>,
    running: AtomicBool,
    terminated: AtomicBool,
}

/// A real-time multi-track mixing engine.
///
/// Construct with a validated `EngineConfig`, `start()` the output stream,
/// load tracks and issue playback commands from any thread, `shutdown()`
/// when done (also performed on drop).
pub struct AudioEngine {
    shared: Arc<EngineShared>,
    command_tx: Sender<MixerCommand>,
    event_tx: Mutex<Option<Sender<EngineEvent>>>,
    core: Mutex<Option<MixerCore>>,
    device: Mutex<Box<dyn OutputDevice>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    watcher_thread: Mutex<Option<JoinHandle<()>>>,
    /// Serializes the capacity check in play/resume against concurrent
    /// callers.
    play_gate: Mutex<()>,
    stats: Arc<MixerStats>,
    next_key: AtomicU64,
}

impl AudioEngine {
    /// Creates an engine for the given configuration. The output stream is
    /// not opened until `start()`.
    pub fn new(config: EngineConfig) -> Result<AudioEngine, EngineError> {
        config.validate()?;

        let (command_tx, command_rx) = unbounded::<MixerCommand>();
        let (event_tx, event_rx) = unbounded::<EngineEvent>();
        let stats = Arc::new(MixerStats::new());
        let core = MixerCore::new(
            config.sample_rate,
            config.channels,
            config.buffer_size,
            config.max_tracks,
            command_rx,
            event_tx.clone(),
            stats.clone(),
        );
        let device = device::get_device(&config);
        let watcher = Arc::new(WatcherShared::new());

        let shared = Arc::new(EngineShared {
            config,
            tracks: RwLock::new(HashMap::new()),
            watcher: watcher.clone(),
            analyzers: Mutex::new(AnalyzerRegistry::new()),
            running: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });

        let dispatcher = spawn_dispatcher(shared.clone(), event_rx)?;
        let watcher_thread = spawn_watcher(watcher)?;

        info!(
            sample_rate = shared.config.sample_rate,
            buffer_size = shared.config.buffer_size,
            channels = shared.config.channels,
            max_tracks = shared.config.max_tracks,
            "AudioEngine initialized."
        );

        Ok(AudioEngine {
            shared,
            command_tx,
            event_tx: Mutex::new(Some(event_tx)),
            core: Mutex::new(Some(core)),
            device: Mutex::new(device),
            dispatcher: Mutex::new(Some(dispatcher)),
            watcher_thread: Mutex::new(Some(watcher_thread)),
            play_gate: Mutex::new(()),
            stats,
            next_key: AtomicU64::new(1),
        })
    }

    /// Opens the output stream and begins mixing.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.shared.terminated.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }
        if self.shared.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let core = self
            .core
            .lock()
            .take()
            .ok_or(EngineError::NotRunning)?;
        self.device.lock().start(core)?;
        self.shared.running.store(true, Ordering::Release);
        info!("Audio engine started.");
        Ok(())
    }

    /// Stops the output stream, joins every background thread and drops all
    /// tracks. Idempotent; also called on drop.
    pub fn shutdown(&self) {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);

        // Blocks until the device has returned from its final callback, so
        // the mix core (and its event sender) is gone afterwards.
        self.device.lock().stop();
        self.core.lock().take();

        // Stop loader threads.
        let entries: Vec<Arc<TrackEntry>> = self.shared.tracks.write().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            if let Some(mut loader) = entry.loader.lock().take() {
                loader.shutdown_and_join();
            }
            self.shared.watcher.track_removed(&entry.shared.id);
        }

        // Stop the watcher.
        self.shared.watcher.shutdown();
        if let Some(handle) = self.watcher_thread.lock().take() {
            if handle.join().is_err() {
                error!("Watcher thread panicked during join");
            }
        }

        // Dropping the last event sender ends the dispatcher loop.
        self.event_tx.lock().take();
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                error!("Dispatcher thread panicked during join");
            }
        }

        info!("Audio engine shutdown complete.");
    }

    /// True while the engine is started and the device is healthy.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
            && !self.shared.terminated.load(Ordering::Acquire)
            && !self.device.lock().failed()
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shared.terminated.load(Ordering::Acquire)
            || !self.shared.running.load(Ordering::Acquire)
        {
            return Err(EngineError::NotRunning);
        }
        if self.device.lock().failed() {
            self.shared.running.store(false, Ordering::Release);
            return Err(EngineError::NotRunning);
        }
        Ok(())
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.shared.terminated.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }
        Ok(())
    }

    fn entry(&self, id: &str) -> Result<Arc<TrackEntry>, EngineError> {
        self.shared
            .tracks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn send_event(&self, event: EngineEvent) {
        if let Some(tx) = self.event_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    // ------------------------------------------------------------------
    // Track loading
    // ------------------------------------------------------------------

    /// Loads a source under the given id. An existing track with the same id
    /// is stopped and replaced. Decoding happens on the calling thread;
    /// streaming sources are warmed up before this returns.
    pub fn load_track(
        &self,
        id: &str,
        source: Source,
        mut options: LoadOptions,
    ) -> Result<(), EngineError> {
        let on_complete = options.on_complete.take();
        match self.load_track_inner(id, source, &options) {
            Ok(entry) => {
                *entry.on_complete.lock() = on_complete;
                Ok(())
            }
            Err(e) => {
                error!(track = id, err = e.to_string(), "Failed to load track");
                if let Some(callback) = on_complete {
                    self.send_event(EngineEvent::LoadFailed {
                        id: id.to_string(),
                        reason: e.to_string(),
                        callback,
                    });
                }
                Err(e)
            }
        }
    }

    fn load_track_inner(
        &self,
        id: &str,
        source: Source,
        options: &LoadOptions,
    ) -> Result<Arc<TrackEntry>, EngineError> {
        self.ensure_alive()?;
        if id.is_empty() {
            return Err(EngineError::InvalidArgument("track id is empty".into()));
        }
        let speed = options.speed;
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            return Err(EngineError::InvalidArgument(format!(
                "speed {} out of range [{}, {}]",
                speed, MIN_SPEED, MAX_SPEED
            )));
        }

        let config = &self.shared.config;
        let engine_rate = config.sample_rate;

        // Resolve the source into either a preloaded buffer or an open file
        // stream.
        enum Resolved {
            Preloaded(TrackData),
            Streaming(FileStream),
        }

        let resolved = match source {
            Source::File(path) => {
                let stream = FileStream::open(&path)?;
                let want_stream = match options.mode {
                    LoadMode::Stream => true,
                    LoadMode::Preload => false,
                    LoadMode::Auto => estimated_decoded_bytes(&stream) > STREAM_THRESHOLD_BYTES,
                };
                if want_stream && config.enable_streaming {
                    Resolved::Streaming(stream)
                } else {
                    if want_stream {
                        warn!(
                            track = id,
                            "Streaming disabled by configuration, preloading instead"
                        );
                    }
                    let mut stream = stream;
                    let mut samples = Vec::new();
                    let mut chunk = Vec::new();
                    loop {
                        let frames = stream.next_chunk(&mut chunk, 4096)?;
                        if frames == 0 {
                            break;
                        }
                        samples.extend_from_slice(&chunk);
                    }
                    Resolved::Preloaded(TrackData::new(
                        samples,
                        stream.channels(),
                        stream.sample_rate(),
                    ))
                }
            }
            Source::BufferMono {
                samples,
                sample_rate,
            } => Resolved::Preloaded(TrackData::new(
                samples,
                1,
                sample_rate.unwrap_or(engine_rate),
            )),
            Source::BufferStereo {
                samples,
                sample_rate,
            } => {
                if samples.len() % 2 != 0 {
                    return Err(EngineError::InvalidArgument(
                        "stereo buffer length must be even".into(),
                    ));
                }
                Resolved::Preloaded(TrackData::new(
                    samples,
                    2,
                    sample_rate.unwrap_or(engine_rate),
                ))
            }
        };

        let src_channels = match &resolved {
            Resolved::Preloaded(data) => data.channels,
            Resolved::Streaming(stream) => stream.channels(),
        };
        if !channel::supported(src_channels, config.channels) {
            return Err(EngineError::InvalidArgument(format!(
                "unsupported channel conversion: {} -> {}",
                src_channels, config.channels
            )));
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let buffer_size = config.buffer_size;

        let (entry, active) = match resolved {
            Resolved::Preloaded(mut data) => {
                let mut scalar = 1.0;
                if options.auto_normalize {
                    scalar = data.normalize_to(NORMALIZE_TARGET_PEAK);
                }
                if options.resample_quality == ResampleQuality::High
                    && data.sample_rate != engine_rate
                {
                    debug!(
                        track = id,
                        from = data.sample_rate,
                        to = engine_rate,
                        "Converting sample rate at load time"
                    );
                    let converted =
                        resample_hq(&data.samples, data.channels, data.sample_rate, engine_rate)
                            .map_err(|e| EngineError::DecodeFailed(e.to_string()))?;
                    data = TrackData::new(converted, data.channels, engine_rate);
                }

                let data = Arc::new(data);
                let shared = Arc::new(TrackShared::new(
                    key,
                    id.to_string(),
                    data.sample_rate,
                    data.channels,
                    data.frames() as u64,
                    false,
                    scalar,
                    engine_rate,
                ));
                shared.set_speed(speed);
                let active = ActiveTrack::new(
                    shared.clone(),
                    ActiveSource::Preloaded(data.clone()),
                    buffer_size,
                    config.channels,
                    engine_rate,
                );
                (
                    Arc::new(TrackEntry {
                        shared,
                        data: Some(data),
                        loader: Mutex::new(None),
                        on_complete: Mutex::new(None),
                        failure_reported: AtomicBool::new(false),
                    }),
                    active,
                )
            }
            Resolved::Streaming(stream) => {
                let ratio = stream.sample_rate() as f64 / engine_rate as f64;
                let capacity = ((4.0 * buffer_size as f64 * ratio * MAX_SPEED as f64).ceil()
                    as usize)
                    .max(4 * buffer_size)
                    * config.stream_latency.buffer_multiplier();
                let (producer, consumer) = stream_ring(capacity, stream.channels());

                let shared = Arc::new(TrackShared::new(
                    key,
                    id.to_string(),
                    stream.sample_rate(),
                    stream.channels(),
                    stream.duration_frames(),
                    true,
                    1.0,
                    engine_rate,
                ));
                shared.set_speed(speed);

                let event_tx = self
                    .event_tx
                    .lock()
                    .clone()
                    .ok_or(EngineError::NotRunning)?;
                let loader = spawn_loader(
                    stream,
                    producer,
                    shared.clone(),
                    event_tx,
                    options.auto_normalize,
                )?;
                // The loader idles until the track actually plays.
                loader.control.pause();

                let active = ActiveTrack::new(
                    shared.clone(),
                    ActiveSource::Streaming(consumer),
                    buffer_size,
                    config.channels,
                    engine_rate,
                );
                (
                    Arc::new(TrackEntry {
                        shared,
                        data: None,
                        loader: Mutex::new(Some(loader)),
                        on_complete: Mutex::new(None),
                        failure_reported: AtomicBool::new(false),
                    }),
                    active,
                )
            }
        };

        // Insert atomically: a conflicting id is replaced, capacity is
        // enforced against the post-replacement count.
        let replaced = {
            let mut tracks = self.shared.tracks.write();
            let replaced = tracks.remove(id);
            if replaced.is_none() && tracks.len() >= config.max_tracks {
                return Err(EngineError::CapacityExceeded(config.max_tracks));
            }
            tracks.insert(id.to_string(), entry.clone());
            replaced
        };
        if let Some(old) = replaced {
            debug!(track = id, "Replacing existing track");
            self.teardown_entry(&old);
        }

        self.shared.watcher.track_added(entry.shared.clone());
        self.command_tx
            .send(MixerCommand::Add(Box::new(active)))
            .map_err(|_| EngineError::NotRunning)?;

        info!(
            track = id,
            sample_rate = entry.shared.sample_rate,
            channels = entry.shared.channels,
            frames = entry.shared.duration_frames,
            streaming = entry.shared.streaming,
            "Track loaded."
        );
        Ok(entry)
    }

    /// Removes a track's mixer state and joins its loader.
    fn teardown_entry(&self, entry: &TrackEntry) {
        entry.shared.active_claim.store(false, Ordering::Release);
        entry.shared.paused_claim.store(false, Ordering::Release);
        self.shared.watcher.track_removed(&entry.shared.id);
        let _ = self.command_tx.send(MixerCommand::Stop {
            key: entry.shared.key,
            fade_frames: 0,
        });
        let _ = self.command_tx.send(MixerCommand::Remove {
            key: entry.shared.key,
        });
        if let Some(mut loader) = entry.loader.lock().take() {
            loader.shutdown_and_join();
        }
    }

    /// Stops and unloads a track, releasing its buffers and joining its
    /// loader thread.
    pub fn unload_track(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let entry = self
            .shared
            .tracks
            .write()
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        self.teardown_entry(&entry);
        info!(track = id, "Track unloaded.");
        Ok(())
    }

    /// Unloads every track.
    pub fn clear_all_tracks(&self) {
        let ids = self.list_tracks();
        for id in ids {
            let _ = self.unload_track(&id);
        }
        info!("All tracks cleared.");
    }

    // ------------------------------------------------------------------
    // Playback control
    // ------------------------------------------------------------------

    /// Starts playback of a loaded track from frame zero or the seek
    /// position. Fails if the track is unknown, already playing, or the
    /// active-track cap is reached.
    pub fn play(&self, id: &str, options: PlayOptions) -> Result<(), EngineError> {
        self.ensure_running()?;
        let entry = self.entry(id)?;
        let shared = &entry.shared;

        if let Some(volume) = options.volume {
            if !(0.0..=MAX_VOLUME).contains(&volume) {
                return Err(EngineError::InvalidArgument(format!(
                    "volume {} out of range [0, {}]",
                    volume, MAX_VOLUME
                )));
            }
        }
        let start_frame = match options.seek {
            Some(seconds) => self.seek_frame(shared, seconds)?,
            None => 0,
        };

        let _gate = self.play_gate.lock();
        if shared.active_claim.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyExists(format!(
                "track {} is already playing",
                id
            )));
        }
        let active = self.count_active();
        if active >= self.shared.config.max_tracks {
            return Err(EngineError::CapacityExceeded(self.shared.config.max_tracks));
        }

        if let Some(volume) = options.volume {
            shared.set_volume(volume);
        }
        if let Some(looped) = options.looped {
            shared.set_looped(looped);
        }
        let fade_frames = if options.fade_in { shared.fade_frames() } else { 0 };

        let flush_serial = if shared.streaming {
            let loader = entry.loader.lock();
            let control = loader.as_ref().map(|l| l.control.clone());
            drop(loader);
            match control {
                Some(control) => {
                    control.resume();
                    Some(control.request_seek(start_frame))
                }
                None => None,
            }
        } else {
            None
        };

        shared.active_claim.store(true, Ordering::Release);
        shared.paused_claim.store(false, Ordering::Release);
        let play_serial = shared.bump_play_serial();
        self.command_tx
            .send(MixerCommand::Play {
                key: shared.key,
                start_frame,
                fade_frames,
                flush_serial,
                play_serial,
            })
            .map_err(|_| EngineError::NotRunning)?;

        debug!(
            track = id,
            fade_in = options.fade_in,
            seek = options.seek,
            "Playing track."
        );
        Ok(())
    }

    /// Stops a track, optionally with a fade-out ramp. Stopping an idle
    /// track is a no-op.
    pub fn stop(&self, id: &str, fade_out: bool) -> Result<(), EngineError> {
        self.ensure_running()?;
        let entry = self.entry(id)?;
        let shared = &entry.shared;

        if !shared.active_claim.load(Ordering::Acquire)
            && !shared.paused_claim.load(Ordering::Acquire)
        {
            return Ok(());
        }

        let fade_frames = if fade_out { shared.fade_frames() } else { 0 };
        if !fade_out {
            shared.active_claim.store(false, Ordering::Release);
            if shared.streaming {
                if let Some(loader) = entry.loader.lock().as_ref() {
                    loader.control.pause();
                }
            }
        }
        shared.paused_claim.store(false, Ordering::Release);

        self.command_tx
            .send(MixerCommand::Stop {
                key: shared.key,
                fade_frames,
            })
            .map_err(|_| EngineError::NotRunning)?;
        debug!(track = id, fade_out, "Stopping track.");
        Ok(())
    }

    /// Stops every playing track.
    pub fn stop_all_tracks(&self, fade_out: bool) -> Result<(), EngineError> {
        self.ensure_running()?;
        for id in self.list_tracks() {
            let _ = self.stop(&id, fade_out);
        }
        Ok(())
    }

    /// Pauses a playing track, retaining its cursor.
    pub fn pause(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_running()?;
        let entry = self.entry(id)?;
        let shared = &entry.shared;
        if !shared.active_claim.load(Ordering::Acquire) {
            return Ok(());
        }
        shared.active_claim.store(false, Ordering::Release);
        shared.paused_claim.store(true, Ordering::Release);
        if shared.streaming {
            if let Some(loader) = entry.loader.lock().as_ref() {
                loader.control.pause();
            }
        }
        self.command_tx
            .send(MixerCommand::Pause { key: shared.key })
            .map_err(|_| EngineError::NotRunning)?;
        debug!(track = id, "Paused track.");
        Ok(())
    }

    /// Resumes a paused track from its retained cursor.
    pub fn resume(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_running()?;
        let entry = self.entry(id)?;
        let shared = &entry.shared;
        if !shared.paused_claim.load(Ordering::Acquire) {
            return Ok(());
        }

        let _gate = self.play_gate.lock();
        if self.count_active() >= self.shared.config.max_tracks {
            return Err(EngineError::CapacityExceeded(self.shared.config.max_tracks));
        }
        shared.paused_claim.store(false, Ordering::Release);
        shared.active_claim.store(true, Ordering::Release);
        if shared.streaming {
            if let Some(loader) = entry.loader.lock().as_ref() {
                loader.control.resume();
            }
        }
        self.command_tx
            .send(MixerCommand::Resume { key: shared.key })
            .map_err(|_| EngineError::NotRunning)?;
        debug!(track = id, "Resumed track.");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Sets the target volume. The applied gain ramps smoothly.
    pub fn set_volume(&self, id: &str, volume: f32) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if !(0.0..=MAX_VOLUME).contains(&volume) {
            return Err(EngineError::InvalidArgument(format!(
                "volume {} out of range [0, {}]",
                volume, MAX_VOLUME
            )));
        }
        self.entry(id)?.shared.set_volume(volume);
        Ok(())
    }

    /// Sets the playback speed multiplier.
    pub fn set_speed(&self, id: &str, speed: f32) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            return Err(EngineError::InvalidArgument(format!(
                "speed {} out of range [{}, {}]",
                speed, MIN_SPEED, MAX_SPEED
            )));
        }
        self.entry(id)?.shared.set_speed(speed);
        Ok(())
    }

    pub fn set_loop(&self, id: &str, looped: bool) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.entry(id)?.shared.set_looped(looped);
        Ok(())
    }

    /// Sets the fade-in/fade-out ramp length for subsequent fades.
    pub fn set_fade_duration(&self, id: &str, seconds: f64) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if seconds <= 0.0 || !seconds.is_finite() {
            return Err(EngineError::InvalidArgument(format!(
                "fade duration {} must be positive",
                seconds
            )));
        }
        let frames = (seconds * self.shared.config.sample_rate as f64) as u64;
        self.entry(id)?.shared.set_fade_frames(frames.max(1));
        Ok(())
    }

    /// Ramps the applied gain to silence while keeping the target volume, so
    /// unmute restores it exactly.
    pub fn mute(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.entry(id)?.shared.set_muted(true);
        Ok(())
    }

    pub fn unmute(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.entry(id)?.shared.set_muted(false);
        Ok(())
    }

    fn seek_frame(&self, shared: &TrackShared, seconds: f64) -> Result<u64, EngineError> {
        if seconds < 0.0 || !seconds.is_finite() {
            return Err(EngineError::InvalidArgument(format!(
                "seek position {} is negative",
                seconds
            )));
        }
        let frame = (seconds * shared.sample_rate as f64) as u64;
        if shared.duration_frames > 0 && frame >= shared.duration_frames {
            return Err(EngineError::InvalidArgument(format!(
                "seek position {}s is past the end of track {}",
                seconds, shared.id
            )));
        }
        Ok(frame)
    }

    /// Moves the playback cursor. Applied by the mixer on its next callback.
    pub fn seek(&self, id: &str, seconds: f64) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let entry = self.entry(id)?;
        let shared = &entry.shared;
        let frame = self.seek_frame(shared, seconds)?;

        let flush_serial = if shared.streaming {
            entry
                .loader
                .lock()
                .as_ref()
                .map(|loader| loader.control.request_seek(frame))
        } else {
            None
        };
        self.command_tx
            .send(MixerCommand::Seek {
                key: shared.key,
                frame,
                flush_serial,
            })
            .map_err(|_| EngineError::NotRunning)?;
        debug!(track = id, seconds, "Seeking track.");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Crossfade and loudness
    // ------------------------------------------------------------------

    /// Fades out `from` while fading in `to` over the same duration. When no
    /// target volume is given it is computed by loudness matching.
    pub fn crossfade(
        &self,
        from: &str,
        to: &str,
        duration_seconds: f64,
        options: CrossfadeOptions,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        if duration_seconds <= 0.0 || !duration_seconds.is_finite() {
            return Err(EngineError::InvalidArgument(format!(
                "crossfade duration {} must be positive",
                duration_seconds
            )));
        }
        let from_entry = self.entry(from)?;
        let to_entry = self.entry(to)?;
        if !from_entry.shared.active_claim.load(Ordering::Acquire) {
            return Err(EngineError::InvalidArgument(format!(
                "crossfade source {} is not playing",
                from
            )));
        }

        let to_volume = match options.to_volume {
            Some(volume) => volume,
            None => self.matched_crossfade_volume(&from_entry, &to_entry, options.loudness_method),
        };

        let fade_frames =
            ((duration_seconds * self.shared.config.sample_rate as f64) as u64).max(1);
        from_entry.shared.set_fade_frames(fade_frames);
        to_entry.shared.set_fade_frames(fade_frames);

        self.play(
            to,
            PlayOptions {
                fade_in: true,
                looped: Some(options.to_loop),
                seek: None,
                volume: Some(to_volume),
            },
        )?;
        self.stop(from, true)?;
        info!(
            from,
            to,
            duration = duration_seconds,
            to_volume,
            "Crossfading."
        );
        Ok(())
    }

    /// Loudness-matched volume for an incoming crossfade track: the target
    /// is the perceived level of the outgoing track at its current volume.
    fn matched_crossfade_volume(
        &self,
        from: &TrackEntry,
        to: &TrackEntry,
        method: LoudnessMethod,
    ) -> f32 {
        match (&from.data, &to.data) {
            (Some(from_data), Some(to_data)) => {
                let analyzers = self.shared.analyzers.lock();
                let analyzer = analyzers.resolve(method);
                let from_level = analyzer.measure(
                    &from_data.samples,
                    from_data.channels,
                    from_data.sample_rate,
                ) * from.shared.volume();
                let to_level =
                    analyzer.measure(&to_data.samples, to_data.channels, to_data.sample_rate);
                if to_level <= f32::EPSILON {
                    warn!(track = to.shared.id.as_str(), "Silent crossfade target, using unit volume");
                    1.0
                } else {
                    (from_level / to_level).clamp(0.0, MAX_VOLUME)
                }
            }
            _ => {
                warn!("Loudness matching requires preloaded tracks, using current volume");
                from.shared.volume()
            }
        }
    }

    /// Computes volumes that bring both tracks to the target loudness with
    /// the given method. Methods without a registered analyzer fall back to
    /// RMS.
    pub fn match_loudness(
        &self,
        a: &str,
        b: &str,
        target: f32,
        method: LoudnessMethod,
    ) -> Result<(f32, f32), EngineError> {
        self.ensure_alive()?;
        if !(0.0..=1.0).contains(&target) {
            return Err(EngineError::InvalidArgument(format!(
                "target loudness {} out of range [0, 1]",
                target
            )));
        }
        let a_entry = self.entry(a)?;
        let b_entry = self.entry(b)?;
        let (Some(a_data), Some(b_data)) = (&a_entry.data, &b_entry.data) else {
            return Err(EngineError::InvalidArgument(
                "loudness analysis requires preloaded tracks".into(),
            ));
        };

        let analyzers = self.shared.analyzers.lock();
        let analyzer = analyzers.resolve(method);
        let volume_for = |data: &TrackData| {
            let level = analyzer.measure(&data.samples, data.channels, data.sample_rate);
            if level <= f32::EPSILON {
                warn!("Silent track in loudness match, using unit volume");
                1.0
            } else {
                (target / level).clamp(0.0, MAX_VOLUME)
            }
        };
        Ok((volume_for(a_data), volume_for(b_data)))
    }

    /// Registers a plug-in loudness analyzer under its method name.
    pub fn register_loudness_analyzer(&self, analyzer: Box<dyn LoudnessAnalyzer>) {
        self.shared.analyzers.lock().register(analyzer);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_position(&self, id: &str) -> Result<f64, EngineError> {
        Ok(self.entry(id)?.shared.position_seconds())
    }

    pub fn get_duration(&self, id: &str) -> Result<f64, EngineError> {
        Ok(self.entry(id)?.shared.duration_seconds())
    }

    pub fn get_track_info(&self, id: &str) -> Result<TrackInfo, EngineError> {
        let entry = self.entry(id)?;
        let shared = &entry.shared;
        let engine_rate = self.shared.config.sample_rate;
        Ok(TrackInfo {
            id: shared.id.clone(),
            duration: shared.duration_seconds(),
            position: shared.position_seconds(),
            volume: shared.volume(),
            speed: shared.speed(),
            looped: shared.looped(),
            playing: shared.active_claim.load(Ordering::Acquire),
            paused: shared.paused_claim.load(Ordering::Acquire),
            muted: shared.muted(),
            streaming: shared.streaming,
            sample_rate: shared.sample_rate,
            engine_sample_rate: engine_rate,
            sample_rate_ratio: shared.sample_rate_ratio(engine_rate),
        })
    }

    pub fn list_tracks(&self) -> Vec<String> {
        self.shared.tracks.read().keys().cloned().collect()
    }

    pub fn get_playing_tracks(&self) -> Vec<String> {
        self.shared
            .tracks
            .read()
            .values()
            .filter(|e| e.shared.active_claim.load(Ordering::Acquire))
            .map(|e| e.shared.id.clone())
            .collect()
    }

    pub fn get_paused_tracks(&self) -> Vec<String> {
        self.shared
            .tracks
            .read()
            .values()
            .filter(|e| e.shared.paused_claim.load(Ordering::Acquire))
            .map(|e| e.shared.id.clone())
            .collect()
    }

    pub fn get_track_count(&self) -> TrackCounts {
        let tracks = self.shared.tracks.read();
        let playing = tracks
            .values()
            .filter(|e| e.shared.active_claim.load(Ordering::Acquire))
            .count();
        let paused = tracks
            .values()
            .filter(|e| e.shared.paused_claim.load(Ordering::Acquire))
            .count();
        TrackCounts {
            loaded: tracks.len(),
            playing,
            paused,
        }
    }

    fn count_active(&self) -> usize {
        self.shared
            .tracks
            .read()
            .values()
            .filter(|e| e.shared.active_claim.load(Ordering::Acquire))
            .count()
    }

    pub fn get_performance_stats(&self) -> PerformanceStats {
        PerformanceStats {
            cpu_usage: self.stats.cpu_usage(),
            peak_level: self.stats.peak_level(),
            active_tracks: self.count_active(),
            total_tracks: self.shared.tracks.read().len(),
            underruns: self.stats.underruns(),
        }
    }

    // ------------------------------------------------------------------
    // Position callbacks
    // ------------------------------------------------------------------

    /// Registers a callback fired once when the track reaches `target_s`
    /// within `tolerance_s`. Re-registering the same (track, target)
    /// replaces the previous handler.
    pub fn register_position_callback(
        &self,
        id: &str,
        target_s: f64,
        handler: PositionHandler,
        tolerance_s: Option<f64>,
    ) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let tolerance = tolerance_s.unwrap_or(DEFAULT_POSITION_TOLERANCE);
        if target_s < 0.0 || !target_s.is_finite() {
            return Err(EngineError::InvalidArgument(format!(
                "target position {} is invalid",
                target_s
            )));
        }
        if tolerance <= 0.0 || !tolerance.is_finite() {
            return Err(EngineError::InvalidArgument(format!(
                "tolerance {} must be positive",
                tolerance
            )));
        }
        // Fail fast on unknown tracks so a typo doesn't arm a dead callback.
        self.entry(id)?;
        self.shared.watcher.register(id, target_s, tolerance, handler);
        Ok(())
    }

    pub fn remove_position_callback(&self, id: &str, target_s: f64) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if self.shared.watcher.remove(id, target_s) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!(
                "no position callback for track {} at {}s",
                id, target_s
            )))
        }
    }

    pub fn add_global_position_listener(&self, listener: GlobalListener) -> ListenerId {
        self.shared.watcher.add_listener(listener)
    }

    pub fn remove_global_position_listener(&self, id: ListenerId) -> bool {
        self.shared.watcher.remove_listener(id)
    }

    pub fn clear_all_position_callbacks(&self) {
        self.shared.watcher.clear_registrations();
    }

    pub fn get_position_callback_stats(&self) -> PositionCallbackStats {
        self.shared.watcher.stats()
    }

    /// Test hook: manual render handle for the mock device.
    #[cfg(test)]
    pub(crate) fn mock_handle(&self) -> crate::device::mock::MockHandle {
        self.device
            .lock()
            .as_mock()
            .expect("engine is not using the mock device")
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns the dispatcher thread delivering engine events to user callbacks.
/// Exits when every event sender is gone.
fn spawn_dispatcher(
    shared: Arc<EngineShared>,
    event_rx: Receiver<EngineEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("rtmix-events".into())
        .spawn(move || {
            for event in event_rx.iter() {
                match event {
                    EngineEvent::Completed { track, play_serial } => {
                        let entry = shared.tracks.read().get(&track.id).cloned();
                        let Some(entry) = entry else { continue };
                        if entry.shared.key != track.key {
                            continue; // stale event for a replaced track
                        }
                        // Only release the claim if no newer playback started
                        // since this completion was reported.
                        if entry.shared.play_serial() == play_serial {
                            entry.shared.active_claim.store(false, Ordering::Release);
                            entry.shared.paused_claim.store(false, Ordering::Release);
                            if entry.shared.streaming {
                                if let Some(loader) = entry.loader.lock().as_ref() {
                                    loader.control.pause();
                                }
                            }
                        }
                        debug!(track = track.id.as_str(), "Track finished.");
                        if !entry.failure_reported.swap(false, Ordering::AcqRel) {
                            if let Some(callback) = entry.on_complete.lock().as_mut() {
                                callback(&track.id, true, None);
                            }
                        }
                    }
                    EngineEvent::StreamFailed { track, reason } => {
                        error!(track = track.id.as_str(), err = reason.as_str(), "Streaming track failed");
                        let entry = shared.tracks.read().get(&track.id).cloned();
                        let Some(entry) = entry else { continue };
                        if entry.shared.key != track.key {
                            continue;
                        }
                        entry.failure_reported.store(true, Ordering::Release);
                        if let Some(callback) = entry.on_complete.lock().as_mut() {
                            callback(&track.id, false, Some(&reason));
                        };
                    }
                    EngineEvent::LoadFailed {
                        id,
                        reason,
                        mut callback,
                    } => {
                        callback(&id, false, Some(&reason));
                    }
                    EngineEvent::Removed(track) => {
                        // Dropping here frees buffers off the audio thread.
                        drop(track);
                    }
                }
            }
        })
}
