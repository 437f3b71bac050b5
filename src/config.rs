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
use std::{fmt, str::FromStr};

use crate::error::EngineError;

/// Latency class for the output stream. Controls how much audio is buffered
/// ahead of the device: lower latency means faster reaction to commands,
/// higher latency means more resilience to scheduling jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamLatency {
    #[default]
    Low,
    Medium,
    High,
}

impl StreamLatency {
    /// Multiplier applied to per-track stream buffer sizing.
    pub(crate) fn buffer_multiplier(self) -> usize {
        match self {
            StreamLatency::Low => 1,
            StreamLatency::Medium => 2,
            StreamLatency::High => 4,
        }
    }

    /// Scheduling priority requested for the audio callback thread. Tighter
    /// latency classes leave less headroom per callback, so they ask for
    /// more aggressive scheduling.
    pub(crate) fn callback_thread_priority(self) -> u8 {
        match self {
            StreamLatency::Low => 80,
            StreamLatency::Medium => 70,
            StreamLatency::High => 60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamLatency::Low => "low",
            StreamLatency::Medium => "medium",
            StreamLatency::High => "high",
        }
    }
}

impl FromStr for StreamLatency {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" | "Low" => Ok(StreamLatency::Low),
            "medium" | "Medium" => Ok(StreamLatency::Medium),
            "high" | "High" => Ok(StreamLatency::High),
            _ => Err(EngineError::InvalidArgument(format!(
                "unsupported stream latency: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for StreamLatency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine configuration. Immutable once the engine is constructed.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per audio callback.
    pub buffer_size: usize,
    /// Number of output channels (1 or 2).
    pub channels: u16,
    /// Maximum number of simultaneously loaded tracks.
    pub max_tracks: usize,
    /// Output device name. None selects the default device; a name starting
    /// with "mock" selects the non-audible mock device used in tests.
    pub device: Option<String>,
    /// Latency class for the output stream.
    pub stream_latency: StreamLatency,
    /// Whether large files may be streamed from disk instead of preloaded.
    pub enable_streaming: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sample_rate: 48000,
            buffer_size: 1024,
            channels: 2,
            max_tracks: 32,
            device: None,
            stream_latency: StreamLatency::Low,
            enable_streaming: true,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration. Called by the engine constructor.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sample_rate == 0 {
            return Err(EngineError::InvalidArgument(
                "sample rate must be greater than 0".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(EngineError::InvalidArgument(
                "buffer size must be greater than 0".into(),
            ));
        }
        if self.channels != 1 && self.channels != 2 {
            return Err(EngineError::InvalidArgument(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        if self.max_tracks == 0 {
            return Err(EngineError::InvalidArgument(
                "max tracks must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// The real-time budget for one callback, in seconds.
    pub fn callback_period(&self) -> f64 {
        self.buffer_size as f64 / self.sample_rate as f64
    }
}
