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
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::mixer::MixerCore;

pub mod cpal;
pub mod mock;

/// An output device that drives the mix core. The engine hands the core to
/// the device at start; the device invokes `MixerCore::process` from its
/// callback until stopped.
pub(crate) trait OutputDevice: Send {
    /// The device name, for logs and diagnostics.
    fn name(&self) -> String;

    /// Opens the output stream and begins invoking the core. Returns an
    /// error if the device rejects the engine's format.
    fn start(&mut self, core: MixerCore) -> Result<(), EngineError>;

    /// Stops the stream, blocking until the device has returned from its
    /// final callback.
    fn stop(&mut self);

    /// True once the driver reported a stream error; the engine then refuses
    /// further commands.
    fn failed(&self) -> bool;

    /// Test hook: the mock device exposes a manual render handle.
    #[cfg(test)]
    fn as_mock(&self) -> Option<mock::MockHandle> {
        None
    }
}

/// Selects the output device for the given configuration. A device name
/// beginning with "mock" selects the non-audible mock device.
pub(crate) fn get_device(config: &EngineConfig) -> Box<dyn OutputDevice> {
    if let Some(name) = &config.device {
        if name.starts_with("mock") {
            return Box::new(mock::Device::get(name, config));
        }
    }
    Box::new(cpal::Device::new(config))
}

/// Lists the names of output devices known to cpal.
pub fn list_devices() -> Result<Vec<String>, EngineError> {
    cpal::list_output_device_names()
}
