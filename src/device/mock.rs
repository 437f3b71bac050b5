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
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::mixer::MixerCore;

/// A mock device: produces no sound. Tests pump the mix core manually
/// through a `MockHandle`, one callback at a time, so output is
/// deterministic.
pub(crate) struct Device {
    name: String,
    channels: usize,
    core: Arc<Mutex<Option<MixerCore>>>,
}

impl Device {
    pub fn get(name: &str, config: &EngineConfig) -> Device {
        Device {
            name: name.to_string(),
            channels: config.channels as usize,
            core: Arc::new(Mutex::new(None)),
        }
    }
}

/// Clonable handle that renders callbacks on demand.
#[derive(Clone)]
pub(crate) struct MockHandle {
    channels: usize,
    core: Arc<Mutex<Option<MixerCore>>>,
}

impl MockHandle {
    /// Runs one callback of `frames` frames and returns the interleaved
    /// output, or silence when the device is stopped.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut output = vec![0.0f32; frames * self.channels];
        let mut guard = self.core.lock().expect("mock device lock poisoned");
        if let Some(core) = guard.as_mut() {
            core.process(&mut output);
        }
        output
    }
}

impl super::OutputDevice for Device {
    fn name(&self) -> String {
        format!("{} (Mock)", self.name)
    }

    fn start(&mut self, core: MixerCore) -> Result<(), EngineError> {
        info!(device = self.name.as_str(), "Mock output started.");
        *self.core.lock().expect("mock device lock poisoned") = Some(core);
        Ok(())
    }

    fn stop(&mut self) {
        info!(device = self.name.as_str(), "Mock output stopped.");
        self.core.lock().expect("mock device lock poisoned").take();
    }

    fn failed(&self) -> bool {
        false
    }

    #[cfg(test)]
    fn as_mock(&self) -> Option<MockHandle> {
        Some(MockHandle {
            channels: self.channels,
            core: self.core.clone(),
        })
    }
}
