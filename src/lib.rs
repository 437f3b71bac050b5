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

//! Real-time multi-track audio mixing engine.
//!
//! `rtmix` mixes any number of named tracks down to one output stream in a
//! hard-real-time audio callback. Tracks are loaded from files (decoded via
//! symphonia) or from in-memory PCM buffers, either fully preloaded or
//! streamed from disk through a lock-free ring fed by a background loader
//! thread. Per-track playback supports volume with smooth ramps, fade-in and
//! fade-out, playback speed with linear resampling, looping, seeking,
//! mute/unmute, crossfades with loudness matching, and position callbacks
//! with millisecond-level precision.
//!
//! ```no_run
//! use rtmix::{AudioEngine, EngineConfig, LoadOptions, PlayOptions, Source};
//!
//! let engine = AudioEngine::new(EngineConfig::default())?;
//! engine.start()?;
//! engine.load_track("music", Source::file("music.flac"), LoadOptions::new())?;
//! engine.play("music", PlayOptions { fade_in: true, ..Default::default() })?;
//! # Ok::<(), rtmix::EngineError>(())
//! ```

pub mod config;
pub mod device;
pub mod dsp;
pub mod engine;
pub mod error;
mod events;
mod mixer;
pub mod ring;
pub mod source;
mod stream;
#[cfg(test)]
mod test;
mod testutil;
pub mod track;
mod watcher;

pub use config::{EngineConfig, StreamLatency};
pub use device::list_devices;
pub use dsp::loudness::{LoudnessAnalyzer, LoudnessMethod};
pub use engine::{
    AudioEngine, CrossfadeOptions, LoadMode, LoadOptions, PerformanceStats, PlayOptions,
    ResampleQuality, DEFAULT_POSITION_TOLERANCE,
};
pub use error::EngineError;
pub use events::CompleteCallback;
pub use source::Source;
pub use track::{TrackCounts, TrackInfo, TrackState};
pub use watcher::{GlobalListener, ListenerId, PositionCallbackStats, PositionHandler};
