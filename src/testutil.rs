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

#[cfg(test)]
use std::{
    path::Path,
    thread,
    time::{Duration, Instant},
};

#[cfg(test)]
use hound::{SampleFormat, WavSpec, WavWriter};

/// Polls `predicate` until it holds, panicking with `error_msg` once the
/// deadline passes. Polling starts fast and widens additively so a condition
/// that settles quickly is observed quickly.
#[cfg(test)]
pub fn eventually<F>(mut predicate: F, error_msg: &str)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut wait = Duration::from_millis(2);

    while !predicate() {
        if Instant::now() >= deadline {
            panic!("{}", error_msg);
        }
        thread::sleep(wait);
        wait = (wait + Duration::from_millis(10)).min(Duration::from_millis(80));
    }
}

/// Writes interleaved f32 samples to a WAV file.
#[cfg(test)]
pub fn write_wav_f32<P: AsRef<Path>>(path: P, samples: &[f32], channels: u16, sample_rate: u32) {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).expect("failed to create wav");
    for &sample in samples {
        writer.write_sample(sample).expect("failed to write sample");
    }
    writer.finalize().expect("failed to finalize wav");
}

/// Interleaved stereo sine: both channels carry the same signal.
#[cfg(test)]
pub fn stereo_sine(frames: usize, frequency: f64, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    let mut samples = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        let value = amplitude
            * (2.0 * std::f64::consts::PI * frequency * i as f64 / sample_rate as f64).sin() as f32;
        samples.push(value);
        samples.push(value);
    }
    samples
}

/// Mono sine.
#[cfg(test)]
pub fn mono_sine(frames: usize, frequency: f64, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    (0..frames)
        .map(|i| {
            amplitude
                * (2.0 * std::f64::consts::PI * frequency * i as f64 / sample_rate as f64).sin()
                    as f32
        })
        .collect()
}
