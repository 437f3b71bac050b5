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
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Default fade length for fade-in/fade-out ramps, in seconds.
pub const DEFAULT_FADE_SECONDS: f64 = 0.05;

/// How long the smoothed volume takes to traverse full scale when no fade is
/// active (set_volume and mute/unmute ramping).
pub const VOLUME_RAMP_SECONDS: f64 = 0.05;

/// Valid playback speed range.
pub const MIN_SPEED: f32 = 0.1;
pub const MAX_SPEED: f32 = 4.0;

/// Valid target volume range. Values above 1.0 are permitted for loudness
/// matching headroom.
pub const MAX_VOLUME: f32 = 2.0;

/// Lifecycle state of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackState {
    Idle = 0,
    Playing = 1,
    Paused = 2,
    FadingIn = 3,
    FadingOut = 4,
    Ending = 5,
}

impl TrackState {
    pub(crate) fn from_u8(value: u8) -> TrackState {
        match value {
            1 => TrackState::Playing,
            2 => TrackState::Paused,
            3 => TrackState::FadingIn,
            4 => TrackState::FadingOut,
            5 => TrackState::Ending,
            _ => TrackState::Idle,
        }
    }

    /// Active tracks contribute audio and count toward the playing cap.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TrackState::Playing | TrackState::FadingIn | TrackState::FadingOut | TrackState::Ending
        )
    }
}

/// The track record shared between the control plane, the mixer and the
/// position watcher.
///
/// Parameter slots (volume, speed, loop, mute, fade length) are written by
/// control threads and read by the mixer at callback entry. Cursor, smoothed
/// volume and live state are mixer-owned and published here with release
/// stores so watchers read them with bounded skew and no locks.
pub(crate) struct TrackShared {
    /// Engine-unique key; survives id reuse across load/unload cycles.
    pub key: u64,
    /// Caller-supplied track id.
    pub id: String,
    /// Source sample rate in Hz.
    pub sample_rate: u32,
    /// Source channel count.
    pub channels: u16,
    /// Source length in frames (0 when unknown for a stream).
    pub duration_frames: u64,
    pub streaming: bool,
    /// Fixed gain decided at load time by auto-normalization.
    pub normalize_scalar: f32,

    // Parameter slots.
    volume: AtomicU32,
    speed: AtomicU32,
    looped: AtomicBool,
    /// While muted the volume slot keeps the pre-mute target, so unmute
    /// restores it exactly; the mixer ramps the applied gain to zero.
    muted: AtomicBool,
    /// Fade ramp length in output frames.
    fade_frames: AtomicU64,

    // Engine-side claims, kept synchronous with control-plane calls so
    // capacity checks don't depend on callback timing.
    pub(crate) active_claim: AtomicBool,
    pub(crate) paused_claim: AtomicBool,
    /// Bumped on every play; completion events carry the serial they belong
    /// to so a stale event cannot clear a newer playback's claim.
    play_serial: AtomicU64,

    // Mixer-owned published state.
    state: AtomicU8,
    position_frames: AtomicU64,
    current_volume: AtomicU32,
    pub(crate) underruns: AtomicU64,
}

impl TrackShared {
    pub fn new(
        key: u64,
        id: String,
        sample_rate: u32,
        channels: u16,
        duration_frames: u64,
        streaming: bool,
        normalize_scalar: f32,
        engine_sample_rate: u32,
    ) -> TrackShared {
        let fade_frames = (DEFAULT_FADE_SECONDS * engine_sample_rate as f64) as u64;
        TrackShared {
            key,
            id,
            sample_rate,
            channels,
            duration_frames,
            streaming,
            normalize_scalar,
            volume: AtomicU32::new(1.0f32.to_bits()),
            speed: AtomicU32::new(1.0f32.to_bits()),
            looped: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            fade_frames: AtomicU64::new(fade_frames),
            active_claim: AtomicBool::new(false),
            paused_claim: AtomicBool::new(false),
            play_serial: AtomicU64::new(0),
            state: AtomicU8::new(TrackState::Idle as u8),
            position_frames: AtomicU64::new(0),
            current_volume: AtomicU32::new(0.0f32.to_bits()),
            underruns: AtomicU64::new(0),
        }
    }

    /// Cached ratio of source rate to engine rate.
    pub fn sample_rate_ratio(&self, engine_sample_rate: u32) -> f64 {
        self.sample_rate as f64 / engine_sample_rate as f64
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn speed(&self) -> f32 {
        f32::from_bits(self.speed.load(Ordering::Relaxed))
    }

    pub fn set_speed(&self, speed: f32) {
        self.speed.store(speed.to_bits(), Ordering::Relaxed);
    }

    pub fn looped(&self) -> bool {
        self.looped.load(Ordering::Relaxed)
    }

    pub fn set_looped(&self, looped: bool) {
        self.looped.store(looped, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn fade_frames(&self) -> u64 {
        self.fade_frames.load(Ordering::Relaxed)
    }

    pub fn set_fade_frames(&self, frames: u64) {
        self.fade_frames.store(frames, Ordering::Relaxed);
    }

    pub(crate) fn play_serial(&self) -> u64 {
        self.play_serial.load(Ordering::Acquire)
    }

    pub(crate) fn bump_play_serial(&self) -> u64 {
        self.play_serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn state(&self) -> TrackState {
        TrackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn publish_state(&self, state: TrackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Current playback position in source frames.
    pub fn position_frames(&self) -> u64 {
        self.position_frames.load(Ordering::Acquire)
    }

    pub(crate) fn publish_position(&self, frames: u64) {
        self.position_frames.store(frames, Ordering::Release);
    }

    /// Current playback position in seconds.
    pub fn position_seconds(&self) -> f64 {
        self.position_frames() as f64 / self.sample_rate as f64
    }

    /// Source duration in seconds (0.0 when unknown).
    pub fn duration_seconds(&self) -> f64 {
        self.duration_frames as f64 / self.sample_rate as f64
    }

    pub fn current_volume(&self) -> f32 {
        f32::from_bits(self.current_volume.load(Ordering::Acquire))
    }

    pub(crate) fn publish_current_volume(&self, volume: f32) {
        self.current_volume
            .store(volume.to_bits(), Ordering::Release);
    }
}

/// Snapshot of one track's public state.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: String,
    /// Duration in seconds (0.0 when unknown for a stream).
    pub duration: f64,
    /// Current position in seconds.
    pub position: f64,
    /// Target volume.
    pub volume: f32,
    pub speed: f32,
    pub looped: bool,
    pub playing: bool,
    pub paused: bool,
    pub muted: bool,
    pub streaming: bool,
    /// Source sample rate in Hz.
    pub sample_rate: u32,
    pub engine_sample_rate: u32,
    pub sample_rate_ratio: f64,
}

/// Loaded/playing/paused track counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackCounts {
    pub loaded: usize,
    pub playing: usize,
    pub paused: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> TrackShared {
        TrackShared::new(1, "t".into(), 44100, 2, 44100, false, 1.0, 48000)
    }

    #[test]
    fn test_state_roundtrip() {
        let track = shared();
        assert_eq!(track.state(), TrackState::Idle);
        track.publish_state(TrackState::FadingIn);
        assert_eq!(track.state(), TrackState::FadingIn);
        assert!(track.state().is_active());
        track.publish_state(TrackState::Paused);
        assert!(!track.state().is_active());
    }

    #[test]
    fn test_volume_slot_is_bit_exact() {
        let track = shared();
        let value = 0.8137f32;
        track.set_volume(value);
        assert_eq!(track.volume().to_bits(), value.to_bits());
    }

    #[test]
    fn test_position_conversion() {
        let track = shared();
        track.publish_position(22050);
        assert!((track.position_seconds() - 0.5).abs() < 1e-9);
        assert!((track.duration_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_rate_ratio() {
        let track = shared();
        assert!((track.sample_rate_ratio(48000) - 0.91875).abs() < 1e-9);
    }

    #[test]
    fn test_default_fade_frames() {
        let track = shared();
        assert_eq!(track.fade_frames(), (0.05 * 48000.0) as u64);
    }
}
