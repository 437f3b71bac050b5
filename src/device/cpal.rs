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
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::mixer::MixerCore;

/// The cpal-backed output device. The stream object is not Send, so it lives
/// on a dedicated thread for the lifetime of playback; start and stop
/// communicate with that thread over channels.
pub(crate) struct Device {
    name: Option<String>,
    sample_rate: u32,
    channels: u16,
    buffer_size: usize,
    /// Priority requested for the callback thread, from the latency class.
    callback_priority: u8,
    failed: Arc<AtomicBool>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Device {
    pub fn new(config: &EngineConfig) -> Device {
        Device {
            name: config.device.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            buffer_size: config.buffer_size,
            callback_priority: config.stream_latency.callback_thread_priority(),
            failed: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            thread: None,
        }
    }
}

/// Raises the calling thread (the driver's callback thread) to the requested
/// priority and, on unix, asks for SCHED_FIFO so callbacks preempt ordinary
/// work. Refusal is not fatal: playback continues on default scheduling.
fn promote_callback_thread(priority: u8) {
    let value = match ThreadPriorityValue::try_from(priority) {
        Ok(value) => value,
        Err(_) => return,
    };
    let priority = ThreadPriority::Crossplatform(value);
    let _ = set_current_thread_priority(priority);

    #[cfg(unix)]
    {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        match set_thread_priority_and_policy(
            thread_native_id(),
            priority,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => info!("Audio callback thread switched to realtime scheduling"),
            Err(e) => warn!(
                err = %e,
                "Realtime scheduling unavailable for audio callback thread"
            ),
        }
    }
}

/// Finds the configured cpal output device, or the default one.
fn find_device(name: Option<&str>) -> Result<cpal::Device, EngineError> {
    // Suppress noisy driver output during enumeration.
    let _shh_stdout = shh::stdout();
    let _shh_stderr = shh::stderr();

    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| EngineError::DeviceFailed(e.to_string()))?
            .find(|device| {
                device
                    .name()
                    .map(|n| n.trim() == name.trim())
                    .unwrap_or(false)
            })
            .ok_or_else(|| EngineError::DeviceFailed(format!("no device found with name {}", name))),
        None => host
            .default_output_device()
            .ok_or_else(|| EngineError::DeviceFailed("no default output device".into())),
    }
}

/// Lists cpal output device names across all hosts.
pub fn list_output_device_names() -> Result<Vec<String>, EngineError> {
    let _shh_stdout = shh::stdout();
    let _shh_stderr = shh::stderr();

    let mut names = Vec::new();
    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(host) => host,
            Err(e) => {
                error!(
                    err = e.to_string(),
                    host = host_id.name(),
                    "Unable to open host"
                );
                continue;
            }
        };
        let devices = match host.output_devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!(
                    err = e.to_string(),
                    host = host_id.name(),
                    "Unable to list devices for host"
                );
                continue;
            }
        };
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

impl super::OutputDevice for Device {
    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "default".to_string())
    }

    fn start(&mut self, mut core: MixerCore) -> Result<(), EngineError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), EngineError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let name = self.name.clone();
        let sample_rate = self.sample_rate;
        let channels = self.channels;
        let buffer_size = self.buffer_size;
        let callback_priority = self.callback_priority;
        let failed = self.failed.clone();

        let thread = thread::Builder::new()
            .name("rtmix-output".into())
            .spawn(move || {
                let device = match find_device(name.as_deref()) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let device_name = device.name().unwrap_or_default();

                // Scheduling can only be requested from the callback thread
                // itself, so it happens on the first invocation.
                let mut promoted = false;
                let data_callback = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !promoted {
                        promoted = true;
                        promote_callback_thread(callback_priority);
                    }
                    core.process(data);
                };

                let error_failed = failed.clone();
                let error_callback = move |err: cpal::StreamError| {
                    error!(err = err.to_string(), "Error during output stream.");
                    error_failed.store(true, Ordering::Release);
                };

                // The device picks its own callback size; the core chunks
                // requests larger than the engine's quantum.
                let stream_config = cpal::StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };

                let stream = match device.build_output_stream(
                    &stream_config,
                    data_callback,
                    error_callback,
                    None,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(
                            err = e.to_string(),
                            device = device_name.as_str(),
                            "Unable to open output stream"
                        );
                        let _ = ready_tx.send(Err(EngineError::DeviceFailed(format!(
                            "unable to open output stream on {}: {}",
                            device_name, e
                        ))));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(EngineError::DeviceFailed(e.to_string())));
                    return;
                }

                info!(
                    device = device_name.as_str(),
                    sample_rate, channels, buffer_size, "Output stream started."
                );
                let _ = ready_tx.send(Ok(()));

                // Hold the stream alive until stop; dropping it here blocks
                // until the device has returned from its final callback.
                let _ = stop_rx.recv();
                drop(stream);
                info!(device = device_name.as_str(), "Output stream stopped.");
            })
            .map_err(|e| EngineError::DeviceFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(EngineError::DeviceFailed(
                    "output thread exited unexpectedly".into(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Output thread panicked during join");
            }
        }
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}
