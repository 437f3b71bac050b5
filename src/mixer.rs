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

//! The mix core executed inside the audio callback.
//!
//! On every device callback the core drains pending control commands, walks
//! its tracks, pulls each active track's contribution through the per-track
//! DSP chain (resample, channel-adapt, volume envelope), sums into the output
//! buffer, hard-clips and updates statistics. The callback never allocates,
//! never blocks and never calls into the decoder: preloaded audio is read
//! through an `Arc`, streamed audio through a lock-free SPSC ring, and all
//! buffers are sized up front.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::dsp::channel;
use crate::dsp::resample::{lerp, LinearResampler};
use crate::events::EngineEvent;
use crate::ring::StreamConsumer;
use crate::source::TrackData;
use crate::track::{TrackShared, TrackState, MAX_SPEED, MAX_VOLUME, MIN_SPEED, VOLUME_RAMP_SECONDS};

/// Commands from the control plane, drained at callback entry. Sent over an
/// unbounded channel so callers never block and the callback never waits.
pub(crate) enum MixerCommand {
    /// Insert a fully-built track. Capacity is enforced by the control plane.
    Add(Box<ActiveTrack>),
    /// Remove a track; it is shipped back over the event channel so its
    /// buffers are dropped off the audio thread.
    Remove { key: u64 },
    Play {
        key: u64,
        start_frame: u64,
        fade_frames: u64,
        /// Streaming: seek serial to synchronize the ring flush with.
        flush_serial: Option<u64>,
        /// Identifies this playback in completion events.
        play_serial: u64,
    },
    Pause { key: u64 },
    Resume { key: u64 },
    /// fade_frames == 0 stops immediately.
    Stop { key: u64, fade_frames: u64 },
    Seek {
        key: u64,
        frame: u64,
        flush_serial: Option<u64>,
    },
}

/// Where a track's samples come from.
pub(crate) enum ActiveSource {
    /// Immutable PCM shared with the control plane.
    Preloaded(Arc<TrackData>),
    /// Consumer end of the loader thread's ring.
    Streaming(StreamConsumer),
}

/// Mixer-side playback state for one loaded track. Owned exclusively by the
/// audio thread; the control plane reaches it only through `TrackShared`
/// parameter slots and `MixerCommand`s.
pub(crate) struct ActiveTrack {
    pub shared: Arc<TrackShared>,
    source: ActiveSource,
    /// Playback cursor in source frames.
    cursor: f64,
    /// Smoothed gain actually applied to samples.
    current_volume: f32,
    /// Output frames left in the active fade ramp.
    fade_remaining: u64,
    /// Streaming: ring flush to apply once the loader reaches this serial.
    pending_flush: Option<u64>,
    /// Serial of the playback currently running, echoed in completion events.
    play_serial: u64,
    /// Per-frame step of the fixed-rate volume smoothing ramp.
    volume_ramp_step: f32,
    /// Set once the terminal Completed event for this playback was sent.
    completion_sent: bool,
    /// Resampled audio at source channel count: buffer_size * channels.
    work: Vec<f32>,
    /// Channel-adapted audio: buffer_size * output channels.
    mix: Vec<f32>,
    /// Streaming pop buffer, sized for the worst-case resample ratio.
    scratch: Vec<f32>,
    resampler: LinearResampler,
}

impl ActiveTrack {
    /// Builds the mixer-side track on a control thread, pre-allocating every
    /// buffer the callback will need at the worst-case speed.
    pub fn new(
        shared: Arc<TrackShared>,
        source: ActiveSource,
        buffer_size: usize,
        output_channels: u16,
        engine_sample_rate: u32,
    ) -> ActiveTrack {
        let src_channels = shared.channels as usize;
        let max_ratio = shared.sample_rate_ratio(engine_sample_rate) * MAX_SPEED as f64;
        let scratch_frames = (buffer_size as f64 * max_ratio).ceil() as usize + 4;
        ActiveTrack {
            resampler: LinearResampler::new(src_channels),
            shared,
            source,
            cursor: 0.0,
            current_volume: 0.0,
            fade_remaining: 0,
            pending_flush: None,
            play_serial: 0,
            volume_ramp_step: (1.0 / (VOLUME_RAMP_SECONDS * engine_sample_rate as f64)) as f32,
            completion_sent: true,
            work: vec![0.0; buffer_size * src_channels],
            mix: vec![0.0; buffer_size * output_channels as usize],
            scratch: vec![0.0; scratch_frames * src_channels],
        }
    }

    pub fn key(&self) -> u64 {
        self.shared.key
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> f64 {
        self.cursor
    }

    fn begin_play(
        &mut self,
        start_frame: u64,
        fade_frames: u64,
        flush_serial: Option<u64>,
        play_serial: u64,
    ) {
        if self.shared.state().is_active() {
            return;
        }
        self.cursor = start_frame as f64;
        if self.shared.duration_frames > 0 {
            self.cursor = self.cursor.min(self.shared.duration_frames.saturating_sub(1) as f64);
        }
        if let Some(serial) = flush_serial {
            self.pending_flush = Some(serial);
            self.resampler.reset();
        }
        self.play_serial = play_serial;
        self.completion_sent = false;
        let target = self.shared.volume().clamp(0.0, MAX_VOLUME);
        if fade_frames > 0 {
            self.current_volume = 0.0;
            self.fade_remaining = fade_frames;
            self.shared.publish_state(TrackState::FadingIn);
        } else {
            self.current_volume = target;
            self.fade_remaining = 0;
            self.shared.publish_state(TrackState::Playing);
        }
        self.shared.publish_position(self.cursor as u64);
        self.shared.publish_current_volume(self.current_volume);
    }

    fn pause(&mut self) {
        match self.shared.state() {
            TrackState::Playing | TrackState::FadingIn => {
                self.fade_remaining = 0;
                self.shared.publish_state(TrackState::Paused);
            }
            _ => {}
        }
    }

    fn resume(&mut self) {
        if self.shared.state() == TrackState::Paused {
            self.shared.publish_state(TrackState::Playing);
        }
    }

    fn begin_stop(&mut self, fade_frames: u64, event_tx: &Sender<EngineEvent>) {
        let state = self.shared.state();
        match state {
            TrackState::Idle | TrackState::Ending => {}
            TrackState::Paused => self.finish(event_tx),
            TrackState::FadingOut => {}
            _ => {
                if fade_frames > 0 {
                    self.fade_remaining = fade_frames;
                    self.shared.publish_state(TrackState::FadingOut);
                } else {
                    self.finish(event_tx);
                }
            }
        }
    }

    fn apply_seek(&mut self, frame: u64, flush_serial: Option<u64>) {
        let mut frame = frame;
        if self.shared.duration_frames > 0 {
            frame = frame.min(self.shared.duration_frames.saturating_sub(1));
        }
        self.cursor = frame as f64;
        if let Some(serial) = flush_serial {
            self.pending_flush = Some(serial);
            self.resampler.reset();
        }
        self.shared.publish_position(frame);
    }

    /// Terminal transition to idle: resets the cursor and reports completion
    /// exactly once per playback.
    fn finish(&mut self, event_tx: &Sender<EngineEvent>) {
        self.cursor = 0.0;
        self.fade_remaining = 0;
        self.shared.publish_state(TrackState::Idle);
        self.shared.publish_position(0);
        if !self.completion_sent {
            self.completion_sent = true;
            let _ = event_tx.send(EngineEvent::Completed {
                track: self.shared.clone(),
                play_serial: self.play_serial,
            });
        }
    }

    /// Renders this track's contribution for one callback and sums it into
    /// `output` (`frames * output_channels` interleaved samples).
    fn render(
        &mut self,
        output: &mut [f32],
        frames: usize,
        sample_rate: u32,
        output_channels: u16,
        event_tx: &Sender<EngineEvent>,
        stats: &MixerStats,
    ) {
        let state = self.shared.state();
        match state {
            TrackState::Ending => {
                // The final partial block went out last callback.
                self.finish(event_tx);
                return;
            }
            TrackState::Playing | TrackState::FadingIn | TrackState::FadingOut => {}
            _ => return,
        }

        // A pending ring flush means the loader has not yet caught up with a
        // seek; contribute silence until post-seek data flows.
        if let Some(serial) = self.pending_flush {
            match &mut self.source {
                ActiveSource::Streaming(consumer) => {
                    if !consumer.flush_for_serial(serial) {
                        return;
                    }
                    self.pending_flush = None;
                }
                ActiveSource::Preloaded(_) => self.pending_flush = None,
            }
        }

        let speed = self.shared.speed().clamp(MIN_SPEED, MAX_SPEED);
        let ratio = self.shared.sample_rate as f64 / sample_rate as f64 * speed as f64;
        let looped = self.shared.looped();

        let preloaded = match &self.source {
            ActiveSource::Preloaded(data) => Some(data.clone()),
            ActiveSource::Streaming(_) => None,
        };
        let (produced, ended) = match preloaded {
            Some(data) => self.produce_preloaded(&data, frames, ratio, looped),
            None => self.produce_streaming(frames, ratio, looped, stats),
        };

        if produced > 0 {
            let src_channels = self.shared.channels;
            let buf_len = frames * output_channels as usize;
            if src_channels == output_channels {
                let work = std::mem::take(&mut self.work);
                self.envelope_and_sum(&work[..buf_len], output, frames, output_channels as usize);
                self.work = work;
            } else {
                channel::adapt(
                    &self.work,
                    src_channels,
                    &mut self.mix,
                    output_channels,
                    frames,
                );
                let mix = std::mem::take(&mut self.mix);
                self.envelope_and_sum(&mix[..buf_len], output, frames, output_channels as usize);
                self.mix = mix;
            }
        }

        self.shared.publish_position(self.cursor as u64);
        self.shared.publish_current_volume(self.current_volume);

        if ended {
            // Natural end: the tail of this block was the last audio. Report
            // now; the state collapses to idle on the next callback.
            self.shared.publish_state(TrackState::Ending);
            if !self.completion_sent {
                self.completion_sent = true;
                let _ = event_tx.send(EngineEvent::Completed {
                    track: self.shared.clone(),
                    play_serial: self.play_serial,
                });
            }
        } else if self.fade_remaining == 0 && self.shared.state() == TrackState::FadingOut {
            self.finish(event_tx);
        } else if self.fade_remaining == 0 && self.shared.state() == TrackState::FadingIn {
            self.shared.publish_state(TrackState::Playing);
        }
    }

    /// Fills `work` with `frames` frames read from the preloaded buffer at
    /// the current cursor. Returns (frames containing audio, ended).
    fn produce_preloaded(
        &mut self,
        data: &TrackData,
        frames: usize,
        ratio: f64,
        looped: bool,
    ) -> (usize, bool) {
        let duration = data.frames();
        let ch = data.channels as usize;
        if duration == 0 {
            return (0, true);
        }

        // Unity ratio with an aligned cursor degenerates to a copy; this is
        // the bit-exact path the identity tests pin down.
        if ratio == 1.0 && self.cursor.fract() == 0.0 {
            let mut pos = self.cursor as usize;
            let mut written = 0;
            while written < frames {
                if pos >= duration {
                    if looped {
                        pos = 0;
                    } else {
                        break;
                    }
                }
                let run = (duration - pos).min(frames - written);
                self.work[written * ch..(written + run) * ch]
                    .copy_from_slice(&data.samples[pos * ch..(pos + run) * ch]);
                pos += run;
                written += run;
            }
            self.work[written * ch..frames * ch].fill(0.0);

            if looped {
                self.cursor = (self.cursor + frames as f64) % duration as f64;
                return (frames, false);
            }
            self.cursor = (self.cursor + frames as f64).min(duration as f64);
            let ended = self.cursor >= duration as f64;
            return (written, ended);
        }

        // Interpolated path.
        let dur_f = duration as f64;
        let mut written = 0;
        for i in 0..frames {
            let p = self.cursor + i as f64 * ratio;
            if looped {
                let pm = p % dur_f;
                let i0 = pm.floor() as usize % duration;
                let i1 = (i0 + 1) % duration;
                let f = (pm - pm.floor()) as f32;
                for c in 0..ch {
                    let a = data.samples[i0 * ch + c];
                    let b = data.samples[i1 * ch + c];
                    self.work[i * ch + c] = lerp(a, b, f);
                }
                written = i + 1;
            } else {
                if p >= dur_f {
                    break;
                }
                let i0 = p.floor() as usize;
                let i1 = (i0 + 1).min(duration - 1);
                let f = (p - p.floor()) as f32;
                for c in 0..ch {
                    let a = data.samples[i0 * ch + c];
                    let b = data.samples[i1 * ch + c];
                    self.work[i * ch + c] = lerp(a, b, f);
                }
                written = i + 1;
            }
        }
        self.work[written * ch..frames * ch].fill(0.0);

        if looped {
            self.cursor = (self.cursor + frames as f64 * ratio) % dur_f;
            (frames, false)
        } else {
            self.cursor = (self.cursor + frames as f64 * ratio).min(dur_f);
            (written, self.cursor >= dur_f)
        }
    }

    /// Pops from the ring and resamples into `work`. Returns (frames
    /// containing audio, ended). A pop deficit zero-fills and counts an
    /// underrun unless the stream has ended.
    fn produce_streaming(
        &mut self,
        frames: usize,
        ratio: f64,
        looped: bool,
        stats: &MixerStats,
    ) -> (usize, bool) {
        let ch = self.shared.channels as usize;
        let consumer = match &mut self.source {
            ActiveSource::Streaming(consumer) => consumer,
            ActiveSource::Preloaded(_) => unreachable!("streaming path on preloaded track"),
        };

        let needed = self.resampler.frames_needed(frames, ratio);
        debug_assert!(needed * ch <= self.scratch.len());
        let scratch = &mut self.scratch[..needed * ch];

        let popped = consumer.pop_frames(scratch, needed);
        let eof = consumer.is_eof();

        if popped == 0 {
            if eof {
                return (0, true);
            }
            consumer.record_underrun();
            stats.record_underrun();
            self.shared.underruns.store(consumer.underruns(), Ordering::Relaxed);
            return (0, false);
        }

        if popped < needed {
            scratch[popped * ch..].fill(0.0);
            if !eof {
                consumer.record_underrun();
                stats.record_underrun();
                self.shared.underruns.store(consumer.underruns(), Ordering::Relaxed);
            }
        }

        let work = &mut self.work[..frames * ch];
        self.resampler.process(scratch, work, frames, ratio);

        // Cursor accounting per the rate relation; on a deficit advance only
        // by what was actually consumed so playback resumes at the right
        // sample after the loader catches up.
        if popped == needed {
            self.cursor += frames as f64 * ratio;
        } else {
            self.cursor += popped as f64;
        }
        if looped && self.shared.duration_frames > 0 {
            self.cursor %= self.shared.duration_frames as f64;
        }

        let ended = eof && consumer.buffered_frames() == 0;
        (frames, ended)
    }

    /// Applies the per-frame volume envelope to `buf` while summing it into
    /// `output`. Advances fade and smoothing ramps.
    fn envelope_and_sum(
        &mut self,
        buf: &[f32],
        output: &mut [f32],
        frames: usize,
        channels: usize,
    ) {
        let target = if self.shared.muted() {
            0.0
        } else {
            self.shared.volume().clamp(0.0, MAX_VOLUME)
        };
        let state = self.shared.state();

        match state {
            TrackState::FadingIn | TrackState::FadingOut => {
                let fade_target = if state == TrackState::FadingOut {
                    0.0
                } else {
                    target
                };
                let remaining = self.fade_remaining.max(1);
                let step = (fade_target - self.current_volume) / remaining as f32;
                let ramp = frames.min(remaining as usize);
                for i in 0..ramp {
                    self.current_volume += step;
                    let g = self.current_volume;
                    for c in 0..channels {
                        output[i * channels + c] += buf[i * channels + c] * g;
                    }
                }
                if remaining as usize <= frames {
                    // The ramp lands exactly on its target this callback.
                    self.current_volume = fade_target;
                    self.fade_remaining = 0;
                    for i in ramp..frames {
                        for c in 0..channels {
                            output[i * channels + c] += buf[i * channels + c] * fade_target;
                        }
                    }
                } else {
                    self.fade_remaining -= frames as u64;
                }
            }
            _ => {
                if self.current_volume != target {
                    // Fixed-rate smoothing for set_volume and mute/unmute.
                    let per_frame = self.volume_ramp_step;
                    for i in 0..frames {
                        if self.current_volume < target {
                            self.current_volume = (self.current_volume + per_frame).min(target);
                        } else {
                            self.current_volume = (self.current_volume - per_frame).max(target);
                        }
                        let g = self.current_volume;
                        for c in 0..channels {
                            output[i * channels + c] += buf[i * channels + c] * g;
                        }
                    }
                } else if self.current_volume == 1.0 {
                    // Unity gain adds samples unmodified (bit-exact path).
                    for (o, s) in output[..frames * channels].iter_mut().zip(buf.iter()) {
                        *o += *s;
                    }
                } else {
                    let g = self.current_volume;
                    for (o, s) in output[..frames * channels].iter_mut().zip(buf.iter()) {
                        *o += *s * g;
                    }
                }
            }
        }
    }

}

/// Global mixer statistics, shared with the control plane.
pub(crate) struct MixerStats {
    peak_level: AtomicU32,
    cpu_usage: AtomicU32,
    underruns: AtomicU64,
    callbacks: AtomicU64,
}

impl MixerStats {
    pub fn new() -> MixerStats {
        MixerStats {
            peak_level: AtomicU32::new(0.0f32.to_bits()),
            cpu_usage: AtomicU32::new(0.0f32.to_bits()),
            underruns: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
        }
    }

    pub fn peak_level(&self) -> f32 {
        f32::from_bits(self.peak_level.load(Ordering::Relaxed))
    }

    pub fn cpu_usage(&self) -> f32 {
        f32::from_bits(self.cpu_usage.load(Ordering::Relaxed))
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }
}

/// The audio-callback half of the engine. Moved into the output stream's
/// callback closure by `AudioEngine::start`.
pub(crate) struct MixerCore {
    sample_rate: u32,
    channels: u16,
    buffer_size: usize,
    tracks: Vec<Box<ActiveTrack>>,
    command_rx: Receiver<MixerCommand>,
    event_tx: Sender<EngineEvent>,
    stats: Arc<MixerStats>,
}

impl MixerCore {
    pub fn new(
        sample_rate: u32,
        channels: u16,
        buffer_size: usize,
        max_tracks: usize,
        command_rx: Receiver<MixerCommand>,
        event_tx: Sender<EngineEvent>,
        stats: Arc<MixerStats>,
    ) -> MixerCore {
        MixerCore {
            sample_rate,
            channels,
            buffer_size,
            tracks: Vec::with_capacity(max_tracks),
            command_rx,
            event_tx,
            stats,
        }
    }

    /// Produces the next block of interleaved output. This is the audio
    /// callback body: bounded work, no allocation, no blocking.
    pub fn process(&mut self, output: &mut [f32]) {
        let started = Instant::now();
        output.fill(0.0);
        let channels = self.channels as usize;
        let total_frames = output.len() / channels;
        if total_frames == 0 {
            return;
        }

        self.drain_commands();

        // The device may hand us more frames than our quantum; per-track
        // buffers are sized for buffer_size, so larger requests are chunked.
        let mut offset = 0;
        while offset < total_frames {
            let frames = (total_frames - offset).min(self.buffer_size);
            let block = &mut output[offset * channels..(offset + frames) * channels];
            let sample_rate = self.sample_rate;
            let out_channels = self.channels;
            let event_tx = &self.event_tx;
            let stats = &self.stats;
            for track in self.tracks.iter_mut() {
                track.render(block, frames, sample_rate, out_channels, event_tx, stats);
            }
            offset += frames;
        }

        // Peak is measured before the limiter so clipping is observable.
        let peak = output.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        self.stats
            .peak_level
            .store(peak.to_bits(), Ordering::Relaxed);

        for sample in output.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        let period = total_frames as f64 / self.sample_rate as f64;
        let busy = started.elapsed().as_secs_f64();
        let sample = (busy / period * 100.0) as f32;
        let previous = self.stats.cpu_usage();
        let smoothed = 0.2 * sample + 0.8 * previous;
        self.stats
            .cpu_usage
            .store(smoothed.to_bits(), Ordering::Relaxed);
        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                MixerCommand::Add(track) => {
                    self.tracks.push(track);
                }
                MixerCommand::Remove { key } => {
                    if let Some(index) = self.find(key) {
                        let track = self.tracks.swap_remove(index);
                        let _ = self.event_tx.send(EngineEvent::Removed(track));
                    }
                }
                MixerCommand::Play {
                    key,
                    start_frame,
                    fade_frames,
                    flush_serial,
                    play_serial,
                } => {
                    if let Some(index) = self.find(key) {
                        self.tracks[index].begin_play(
                            start_frame,
                            fade_frames,
                            flush_serial,
                            play_serial,
                        );
                    }
                }
                MixerCommand::Pause { key } => {
                    if let Some(index) = self.find(key) {
                        self.tracks[index].pause();
                    }
                }
                MixerCommand::Resume { key } => {
                    if let Some(index) = self.find(key) {
                        self.tracks[index].resume();
                    }
                }
                MixerCommand::Stop { key, fade_frames } => {
                    if let Some(index) = self.find(key) {
                        let event_tx = self.event_tx.clone();
                        self.tracks[index].begin_stop(fade_frames, &event_tx);
                    }
                }
                MixerCommand::Seek {
                    key,
                    frame,
                    flush_serial,
                } => {
                    if let Some(index) = self.find(key) {
                        self.tracks[index].apply_seek(frame, flush_serial);
                    }
                }
            }
        }
    }

    fn find(&self, key: u64) -> Option<usize> {
        self.tracks.iter().position(|t| t.key() == key)
    }
}
