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
use std::sync::LazyLock;

use rubato::{calculate_cutoff, Resampler, SincFixedIn, SincInterpolationParameters};

// Sinc resampler configuration for the offline high-quality path.
/// Length of the sinc interpolation filter (higher = better quality, more CPU).
const SINC_LENGTH: usize = 128;
/// Cutoff frequency for the anti-aliasing filter, derived from SINC_LENGTH
/// and the window function once at startup.
static F_CUTOFF: LazyLock<f32> =
    LazyLock::new(|| calculate_cutoff::<f32>(SINC_LENGTH, rubato::WindowFunction::BlackmanHarris2));
/// Oversampling factor for improved interpolation quality.
const OVERSAMPLING_FACTOR: usize = 256;
/// Input block size fed to the sinc resampler.
const INPUT_BLOCK_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ResampleError {
    #[error("resampling failed: {0}Hz -> {1}Hz")]
    Failed(u32, u32),
}

/// Linear interpolation between two adjacent samples at weight `f` in
/// [0, 1]. A weight of exactly 0.0 returns `a` unchanged, which the
/// bit-exact identity paths rely on.
#[inline]
pub(crate) fn lerp(a: f32, b: f32, f: f32) -> f32 {
    a + (b - a) * f
}

/// Streaming linear-interpolation resampler: the mixer's fast path.
///
/// Consumes interleaved source frames block by block and produces a fixed
/// number of output frames per call at an arbitrary (and changeable) ratio.
/// Up to two source frames are carried across calls so interpolation is
/// continuous at block boundaries. No allocation after construction.
///
/// When the ratio is 1.0 and the phase is zero the interpolation weight is
/// exactly 0 for every output frame, so the output is a bit-for-bit copy of
/// the input.
pub struct LinearResampler {
    channels: usize,
    /// Fractional read position relative to the first carried frame.
    frac: f64,
    /// Carried tail of the previous block: `carry_frames` interleaved frames.
    carry: Vec<f32>,
    carry_frames: usize,
}

impl LinearResampler {
    pub fn new(channels: usize) -> Self {
        debug_assert!((1..=2).contains(&channels));
        LinearResampler {
            channels,
            frac: 0.0,
            carry: vec![0.0; channels * 2],
            carry_frames: 0,
        }
    }

    /// Resets phase and carried frames, e.g. after a seek.
    pub fn reset(&mut self) {
        self.frac = 0.0;
        self.carry_frames = 0;
    }

    /// Total frames the virtual buffer (carry + fresh input) must hold to
    /// produce `out_frames` at `ratio`.
    fn needed_total(&self, out_frames: usize, ratio: f64) -> usize {
        let interp_max = (self.frac + (out_frames.saturating_sub(1)) as f64 * ratio).floor()
            as usize
            + 1;
        let advance = (self.frac + out_frames as f64 * ratio).floor() as usize;
        interp_max.max(advance) + 1
    }

    /// Number of fresh source frames that must be supplied to the next
    /// `process` call to produce `out_frames` at `ratio`.
    pub fn frames_needed(&self, out_frames: usize, ratio: f64) -> usize {
        self.needed_total(out_frames, ratio)
            .saturating_sub(self.carry_frames)
    }

    #[inline]
    fn frame_sample(&self, src: &[f32], index: usize, ch: usize) -> f32 {
        if index < self.carry_frames {
            self.carry[index * self.channels + ch]
        } else {
            src[(index - self.carry_frames) * self.channels + ch]
        }
    }

    /// Produces exactly `out_frames` interleaved frames into `out`.
    ///
    /// `src` must hold `frames_needed(out_frames, ratio)` interleaved frames;
    /// a shorter slice is treated as if padded by repeating the last
    /// available frame (the caller is responsible for signaling underflow).
    pub fn process(&mut self, src: &[f32], out: &mut [f32], out_frames: usize, ratio: f64) {
        let channels = self.channels;
        let total = self.carry_frames + src.len() / channels;
        if total == 0 {
            out[..out_frames * channels].fill(0.0);
            return;
        }
        let last = total - 1;

        for i in 0..out_frames {
            let p = self.frac + i as f64 * ratio;
            let i0 = (p.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let f = (p - i0 as f64) as f32;
            for ch in 0..channels {
                let a = self.frame_sample(src, i0, ch);
                let b = self.frame_sample(src, i1, ch);
                out[i * channels + ch] = lerp(a, b, f);
            }
        }

        // Carry everything from the advance point onward (one or two frames)
        // so the next block interpolates seamlessly.
        let advance = ((self.frac + out_frames as f64 * ratio).floor() as usize).min(last);
        let tail = total - advance;
        debug_assert!(tail <= 2);
        let mut stash = [0.0f32; 4];
        for t in 0..tail {
            for ch in 0..channels {
                stash[t * channels + ch] = self.frame_sample(src, advance + t, ch);
            }
        }
        self.carry[..tail * channels].copy_from_slice(&stash[..tail * channels]);
        self.carry_frames = tail;
        self.frac = self.frac + out_frames as f64 * ratio - advance as f64;
    }
}

/// Offline high-quality sinc resampling, used outside the audio callback
/// (load-time sample-rate conversion). Input and output are interleaved.
pub fn resample_hq(
    input: &[f32],
    channels: u16,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>, ResampleError> {
    if from_rate == to_rate {
        return Ok(input.to_vec());
    }

    let num_channels = channels as usize;
    let in_frames = input.len() / num_channels;
    let ratio = to_rate as f64 / from_rate as f64;
    let expected_frames = (in_frames as f64 * ratio).round() as usize;

    let params = SincInterpolationParameters {
        sinc_len: SINC_LENGTH,
        f_cutoff: *F_CUTOFF,
        interpolation: rubato::SincInterpolationType::Linear,
        oversampling_factor: OVERSAMPLING_FACTOR,
        window: rubato::WindowFunction::BlackmanHarris2,
    };
    let max_ratio = (ratio * 1.5).max(10.0);
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, max_ratio, params, INPUT_BLOCK_SIZE, num_channels)
            .map_err(|_| ResampleError::Failed(from_rate, to_rate))?;

    let mut planar_in = vec![vec![0.0f32; INPUT_BLOCK_SIZE]; num_channels];
    let mut planar_out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected_frames); num_channels];

    let mut frame = 0;
    while frame < in_frames {
        let block = INPUT_BLOCK_SIZE.min(in_frames - frame);
        for ch in 0..num_channels {
            for (i, slot) in planar_in[ch].iter_mut().enumerate() {
                // Pad the final partial block with silence.
                *slot = if i < block {
                    input[(frame + i) * num_channels + ch]
                } else {
                    0.0
                };
            }
        }
        let output = resampler
            .process(&planar_in, None)
            .map_err(|_| ResampleError::Failed(from_rate, to_rate))?;
        for (ch, data) in output.into_iter().enumerate() {
            planar_out[ch].extend_from_slice(&data);
        }
        frame += block;
    }

    // The sinc filter delays output by a fixed number of frames; drop the
    // leading transient and trim or pad to the expected length.
    let delay = resampler.output_delay();
    let mut interleaved = vec![0.0f32; expected_frames * num_channels];
    for ch in 0..num_channels {
        for i in 0..expected_frames {
            let idx = i + delay;
            if idx < planar_out[ch].len() {
                interleaved[i * num_channels + ch] = planar_out[ch][idx];
            }
        }
    }

    Ok(interleaved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize, channels: usize) -> Vec<f32> {
        (0..frames * channels)
            .map(|i| (i / channels) as f32 / frames as f32)
            .collect()
    }

    #[test]
    fn test_identity_is_bit_exact() {
        let mut rs = LinearResampler::new(2);
        let src = ramp(20, 2);
        let needed = rs.frames_needed(16, 1.0);
        assert_eq!(needed, 17);

        let mut out = vec![0.0f32; 16 * 2];
        rs.process(&src[..needed * 2], &mut out, 16, 1.0);
        assert_eq!(&out[..], &src[..16 * 2]);

        // Steady state consumes exactly one source frame per output frame.
        assert_eq!(rs.frames_needed(16, 1.0), 16);
    }

    #[test]
    fn test_block_boundary_continuity() {
        // Resampling a long ramp in two blocks must match resampling it in
        // one block: the carry preserves interpolation across the boundary.
        let ratio = 44100.0 / 48000.0;
        let src = ramp(256, 1);

        let mut one = LinearResampler::new(1);
        let needed = one.frames_needed(128, ratio);
        let mut whole = vec![0.0f32; 128];
        one.process(&src[..needed], &mut whole, 128, ratio);

        let mut two = LinearResampler::new(1);
        let mut split = vec![0.0f32; 128];
        let mut consumed = 0;
        for (start, len) in [(0usize, 64usize), (64, 64)] {
            let n = two.frames_needed(len, ratio);
            two.process(&src[consumed..consumed + n], &mut split[start..start + len], len, ratio);
            consumed += n;
        }

        for (a, b) in whole.iter().zip(split.iter()) {
            assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_downsampling_needs_more_frames() {
        let rs = LinearResampler::new(1);
        // ratio 2.0: two source frames per output frame.
        let needed = rs.frames_needed(8, 2.0);
        assert!(needed >= 16);

        let mut rs = LinearResampler::new(1);
        let src: Vec<f32> = (0..needed).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; 8];
        rs.process(&src, &mut out, 8, 2.0);
        for (i, s) in out.iter().enumerate() {
            assert!((s - (i as f32 * 2.0)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_short_input_clamps_to_last_frame() {
        let mut rs = LinearResampler::new(1);
        let src = [1.0f32, 2.0, 3.0];
        let mut out = vec![0.0f32; 8];
        rs.process(&src, &mut out, 8, 1.0);
        assert_eq!(&out[..3], &[1.0, 2.0, 3.0]);
        for s in &out[3..] {
            assert_eq!(*s, 3.0);
        }
    }

    #[test]
    fn test_reset_clears_phase() {
        let mut rs = LinearResampler::new(1);
        let src: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; 8];
        rs.process(&src[..rs.frames_needed(8, 1.5)], &mut out, 8, 1.5);
        rs.reset();
        assert_eq!(rs.frames_needed(8, 1.0), 9);
    }

    #[test]
    fn test_hq_resample_length_and_amplitude() {
        // One second of a 440 Hz sine at 44.1kHz resampled to 48kHz.
        let from = 44100;
        let to = 48000;
        let input: Vec<f32> = (0..from)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / from as f32).sin())
            .collect();

        let output = resample_hq(&input, 1, from as u32, to as u32).unwrap();
        assert_eq!(output.len(), to);

        let peak = output.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!((peak - 1.0).abs() < 0.05, "peak was {}", peak);
    }

    #[test]
    fn test_hq_resample_same_rate_is_identity() {
        let input = ramp(100, 2);
        let output = resample_hq(&input, 2, 48000, 48000).unwrap();
        assert_eq!(output, input);
    }
}
