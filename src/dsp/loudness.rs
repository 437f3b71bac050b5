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
use std::collections::HashMap;

use tracing::warn;

/// Loudness estimation method for match_loudness and crossfade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoudnessMethod {
    /// Root-mean-square level. Built in; also the fallback for every method
    /// with no registered analyzer.
    Rms,
    /// Peak absolute sample. Built in.
    Peak,
    /// Simplified LUFS. Requires a registered analyzer.
    Lufs,
    /// A-weighted level. Requires a registered analyzer.
    AWeighted,
    /// Matchering-style spectral matching. Requires a registered analyzer.
    Matchering,
}

impl LoudnessMethod {
    /// Parses a method name. Unknown names fall back to RMS, matching the
    /// behavior of the match_loudness operation itself.
    pub fn from_name(name: &str) -> LoudnessMethod {
        match name {
            "rms" => LoudnessMethod::Rms,
            "peak" => LoudnessMethod::Peak,
            "lufs" => LoudnessMethod::Lufs,
            "a_weighted" => LoudnessMethod::AWeighted,
            "matchering" => LoudnessMethod::Matchering,
            other => {
                warn!(method = other, "Unknown loudness method, falling back to rms");
                LoudnessMethod::Rms
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoudnessMethod::Rms => "rms",
            LoudnessMethod::Peak => "peak",
            LoudnessMethod::Lufs => "lufs",
            LoudnessMethod::AWeighted => "a_weighted",
            LoudnessMethod::Matchering => "matchering",
        }
    }
}

/// A pluggable loudness analyzer. Third-party implementations (LUFS,
/// A-weighting, matchering) register with the engine under a method name;
/// the built-in RMS analyzer is used whenever no plug-in is present.
pub trait LoudnessAnalyzer: Send + Sync {
    /// The method name this analyzer implements.
    fn name(&self) -> &str;

    /// Returns a linear loudness measure for interleaved samples at unit
    /// gain. A full-scale sine measures close to 0.707 for RMS-like methods
    /// and 1.0 for peak-like methods.
    fn measure(&self, samples: &[f32], channels: u16, sample_rate: u32) -> f32;
}

/// Built-in RMS analyzer.
pub struct RmsAnalyzer;

impl LoudnessAnalyzer for RmsAnalyzer {
    fn name(&self) -> &str {
        "rms"
    }

    fn measure(&self, samples: &[f32], _channels: u16, _sample_rate: u32) -> f32 {
        rms(samples)
    }
}

/// Built-in peak analyzer.
pub struct PeakAnalyzer;

impl LoudnessAnalyzer for PeakAnalyzer {
    fn name(&self) -> &str {
        "peak"
    }

    fn measure(&self, samples: &[f32], _channels: u16, _sample_rate: u32) -> f32 {
        peak(samples)
    }
}

/// Root-mean-square of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Peak absolute sample of a slice.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// Registry of loudness analyzers: the two built-ins plus any plug-ins
/// registered by the host application.
pub struct AnalyzerRegistry {
    rms: RmsAnalyzer,
    peak: PeakAnalyzer,
    custom: HashMap<String, Box<dyn LoudnessAnalyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        AnalyzerRegistry {
            rms: RmsAnalyzer,
            peak: PeakAnalyzer,
            custom: HashMap::new(),
        }
    }

    /// Registers a plug-in analyzer under its own method name, replacing any
    /// previous analyzer with the same name.
    pub fn register(&mut self, analyzer: Box<dyn LoudnessAnalyzer>) {
        self.custom.insert(analyzer.name().to_string(), analyzer);
    }

    /// Resolves a method to an analyzer. Methods without a built-in or
    /// registered implementation fall back to RMS.
    pub fn resolve(&self, method: LoudnessMethod) -> &dyn LoudnessAnalyzer {
        match method {
            LoudnessMethod::Rms => &self.rms,
            LoudnessMethod::Peak => &self.peak,
            other => match self.custom.get(other.as_str()) {
                Some(analyzer) => analyzer.as_ref(),
                None => {
                    warn!(
                        method = other.as_str(),
                        "No analyzer registered for method, falling back to rms"
                    );
                    &self.rms
                }
            },
        }
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        AnalyzerRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frames: usize, amplitude: f32) -> Vec<f32> {
        (0..frames)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * i as f32 / 64.0).sin())
            .collect()
    }

    #[test]
    fn test_rms_of_sine() {
        let samples = sine(6400, 1.0);
        let value = rms(&samples);
        assert!((value - 0.7071).abs() < 0.01, "rms was {}", value);
    }

    #[test]
    fn test_rms_scales_with_amplitude() {
        let loud = rms(&sine(6400, 0.8));
        let quiet = rms(&sine(6400, 0.2));
        assert!((loud / quiet - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_peak() {
        let mut samples = sine(640, 0.5);
        samples[100] = -0.9;
        assert!((peak(&samples) - 0.9).abs() < 1e-6);
        assert_eq!(peak(&[]), 0.0);
    }

    #[test]
    fn test_method_from_name_falls_back_to_rms() {
        assert_eq!(LoudnessMethod::from_name("peak"), LoudnessMethod::Peak);
        assert_eq!(LoudnessMethod::from_name("lufs"), LoudnessMethod::Lufs);
        assert_eq!(LoudnessMethod::from_name("banana"), LoudnessMethod::Rms);
    }

    #[test]
    fn test_registry_fallback() {
        let registry = AnalyzerRegistry::new();
        // No plug-in registered for lufs: falls back to rms.
        let analyzer = registry.resolve(LoudnessMethod::Lufs);
        assert_eq!(analyzer.name(), "rms");
    }

    #[test]
    fn test_registry_plugin_dispatch() {
        struct HalfPeak;
        impl LoudnessAnalyzer for HalfPeak {
            fn name(&self) -> &str {
                "lufs"
            }
            fn measure(&self, samples: &[f32], _c: u16, _r: u32) -> f32 {
                peak(samples) * 0.5
            }
        }

        let mut registry = AnalyzerRegistry::new();
        registry.register(Box::new(HalfPeak));
        let analyzer = registry.resolve(LoudnessMethod::Lufs);
        assert_eq!(analyzer.name(), "lufs");
        let samples = sine(640, 1.0);
        assert!((analyzer.measure(&samples, 1, 48000) - 0.5).abs() < 0.01);
    }
}
