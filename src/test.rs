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

//! Engine-level end-to-end tests, driven through the mock output device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dsp::loudness::{self, LoudnessMethod};
use crate::engine::{CrossfadeOptions, LoadMode, LoadOptions, PlayOptions};
use crate::error::EngineError;
use crate::testutil::{eventually, mono_sine, stereo_sine, write_wav_f32};
use crate::{AudioEngine, EngineConfig, Source};

fn mock_engine(buffer_size: usize, channels: u16) -> AudioEngine {
    let engine = AudioEngine::new(EngineConfig {
        buffer_size,
        channels,
        device: Some("mock".into()),
        ..EngineConfig::default()
    })
    .expect("engine construction failed");
    engine.start().expect("engine start failed");
    engine
}

fn load_quiet(engine: &AudioEngine, id: &str, source: Source) {
    engine
        .load_track(
            id,
            source,
            LoadOptions {
                auto_normalize: false,
                ..LoadOptions::new()
            },
        )
        .expect("load failed");
}

fn peak_of(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

#[test]
fn test_sine_identity_output() {
    // 48000 Hz / stereo / B=1024; a full-scale 440 Hz stereo sine must come
    // through with unit peak, sine RMS, and exact periodicity.
    let engine = mock_engine(1024, 2);
    let sine = stereo_sine(96000, 440.0, 48000, 1.0);
    load_quiet(&engine, "sine", Source::stereo(sine, None));

    engine
        .play(
            "sine",
            PlayOptions {
                volume: Some(1.0),
                ..Default::default()
            },
        )
        .unwrap();

    let output = engine.mock_handle().render(48000);
    assert_eq!(output.len(), 96000);

    let peak = peak_of(&output);
    assert!((peak - 1.0).abs() < 1e-6, "peak was {}", peak);

    let rms = loudness::rms(&output);
    assert!((rms - 0.707).abs() < 0.01, "rms was {}", rms);

    // Left channel of frame n is output[2n]. 440 Hz at 48 kHz repeats
    // exactly every 1200 frames (11 cycles); one nominal period lands near
    // frame 109.
    assert!((output[2 * 1200] - output[0]).abs() < 1e-6);
    assert!((output[2 * 109] - output[0]).abs() < 6e-3);
}

#[test]
fn test_resample_44100_source_plays_one_second() {
    let engine = mock_engine(1024, 2);
    let sine = mono_sine(44100, 440.0, 44100, 1.0);
    load_quiet(&engine, "m", Source::mono(sine, Some(44100)));

    engine.play("m", PlayOptions::default()).unwrap();
    let output = engine.mock_handle().render(50176);

    // Audio must cover one second of output and then stop.
    let frames: Vec<f32> = output.iter().step_by(2).copied().collect();
    assert!(frames[48001..].iter().all(|&s| s == 0.0));
    assert!(frames[47900..48000].iter().any(|&s| s.abs() > 1e-4));

    let peak = peak_of(&output);
    assert!((peak - 1.0).abs() < 0.02, "peak was {}", peak);
}

#[test]
fn test_mute_unmute_round_trip() {
    let engine = mock_engine(1024, 2);
    let sine = stereo_sine(480000, 440.0, 48000, 1.0);
    load_quiet(&engine, "s", Source::stereo(sine, None));

    engine
        .play(
            "s",
            PlayOptions {
                volume: Some(0.8),
                ..Default::default()
            },
        )
        .unwrap();

    let handle = engine.mock_handle();
    let before = peak_of(&handle.render(4096));
    assert!((before - 0.8).abs() < 0.05, "pre-mute peak {}", before);

    engine.mute("s").unwrap();
    let mut muted_peak = f32::MAX;
    for _ in 0..5 {
        muted_peak = peak_of(&handle.render(1024));
    }
    assert!(muted_peak < 1e-3, "peak after mute {}", muted_peak);
    assert!(engine.get_track_info("s").unwrap().muted);

    engine.unmute("s").unwrap();
    let mut restored = 0.0f32;
    for _ in 0..5 {
        restored = peak_of(&handle.render(1024));
    }
    assert!(
        (restored - before).abs() / before < 0.05,
        "peak after unmute {} vs {}",
        restored,
        before
    );
    // The target volume survives the round trip bit for bit.
    assert_eq!(engine.get_track_info("s").unwrap().volume, 0.8);
}

#[test]
fn test_pause_resume_preserves_position() {
    let engine = mock_engine(1024, 2);
    load_quiet(
        &engine,
        "p",
        Source::stereo(stereo_sine(480000, 220.0, 48000, 0.5), None),
    );

    engine.play("p", PlayOptions::default()).unwrap();
    let handle = engine.mock_handle();
    handle.render(4096);

    engine.pause("p").unwrap();
    handle.render(1024);
    let paused_at = engine.get_position("p").unwrap();
    assert!(paused_at > 0.0);
    assert!(engine.get_track_info("p").unwrap().paused);

    // Position holds while paused.
    handle.render(4096);
    assert_eq!(engine.get_position("p").unwrap(), paused_at);

    engine.resume("p").unwrap();
    handle.render(1024);
    assert!(engine.get_position("p").unwrap() > paused_at);
}

#[test]
fn test_seek_lands_within_one_callback() {
    let engine = mock_engine(1024, 2);
    load_quiet(
        &engine,
        "s",
        Source::stereo(stereo_sine(96000, 440.0, 48000, 0.5), None),
    );

    engine.play("s", PlayOptions::default()).unwrap();
    let handle = engine.mock_handle();
    handle.render(1024);

    engine.seek("s", 1.0).unwrap();
    handle.render(1024);
    let position = engine.get_position("s").unwrap();
    let epsilon = 1024.0 / 48000.0;
    assert!(
        (1.0..=1.0 + epsilon + 1e-9).contains(&position),
        "position after seek was {}",
        position
    );

    // Out-of-range seeks are rejected.
    assert!(matches!(
        engine.seek("s", 10.0),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn test_stop_resets_cursor_and_track_can_replay() {
    let engine = mock_engine(1024, 2);
    load_quiet(
        &engine,
        "s",
        Source::stereo(stereo_sine(96000, 440.0, 48000, 0.5), None),
    );

    engine.play("s", PlayOptions::default()).unwrap();
    let handle = engine.mock_handle();
    handle.render(4096);
    assert!(engine.get_position("s").unwrap() > 0.0);

    engine.stop("s", false).unwrap();
    handle.render(1024);
    assert_eq!(engine.get_position("s").unwrap(), 0.0);
    assert!(!engine.get_track_info("s").unwrap().playing);

    engine.play("s", PlayOptions::default()).unwrap();
    handle.render(1024);
    assert!(engine.get_position("s").unwrap() > 0.0);
}

#[test]
fn test_load_unload_round_trip() {
    let engine = mock_engine(1024, 2);
    assert_eq!(engine.get_track_count().loaded, 0);

    load_quiet(
        &engine,
        "a",
        Source::stereo(stereo_sine(4800, 440.0, 48000, 0.5), None),
    );
    assert_eq!(engine.get_track_count().loaded, 1);
    assert_eq!(engine.list_tracks(), vec!["a".to_string()]);

    engine.unload_track("a").unwrap();
    assert_eq!(engine.get_track_count().loaded, 0);
    assert!(engine.list_tracks().is_empty());
    assert!(matches!(
        engine.get_position("a"),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.unload_track("a"),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn test_load_replaces_existing_id() {
    let engine = mock_engine(1024, 2);
    load_quiet(
        &engine,
        "t",
        Source::stereo(stereo_sine(48000, 440.0, 48000, 0.5), None),
    );
    assert!((engine.get_duration("t").unwrap() - 1.0).abs() < 1e-6);

    load_quiet(
        &engine,
        "t",
        Source::stereo(stereo_sine(96000, 440.0, 48000, 0.5), None),
    );
    assert!((engine.get_duration("t").unwrap() - 2.0).abs() < 1e-6);
    assert_eq!(engine.get_track_count().loaded, 1);
}

#[test]
fn test_track_capacity_is_enforced() {
    let engine = AudioEngine::new(EngineConfig {
        buffer_size: 256,
        max_tracks: 4,
        device: Some("mock".into()),
        ..EngineConfig::default()
    })
    .unwrap();
    engine.start().unwrap();

    for i in 0..4 {
        load_quiet(
            &engine,
            &format!("t{}", i),
            Source::stereo(stereo_sine(48000, 440.0, 48000, 0.5), None),
        );
    }
    let result = engine.load_track(
        "t4",
        Source::stereo(stereo_sine(48000, 440.0, 48000, 0.5), None),
        LoadOptions::new(),
    );
    assert!(matches!(result, Err(EngineError::CapacityExceeded(4))));
    // The failed load modified nothing.
    assert_eq!(engine.get_track_count().loaded, 4);
    assert_eq!(engine.get_track_count().playing, 0);
}

#[test]
fn test_play_errors() {
    let engine = mock_engine(1024, 2);
    assert!(matches!(
        engine.play("missing", PlayOptions::default()),
        Err(EngineError::NotFound(_))
    ));

    load_quiet(
        &engine,
        "s",
        Source::stereo(stereo_sine(480000, 440.0, 48000, 0.5), None),
    );
    engine.play("s", PlayOptions::default()).unwrap();
    assert!(matches!(
        engine.play("s", PlayOptions::default()),
        Err(EngineError::AlreadyExists(_))
    ));

    assert!(matches!(
        engine.play(
            "s",
            PlayOptions {
                volume: Some(5.0),
                ..Default::default()
            }
        ),
        Err(EngineError::InvalidArgument(_)) | Err(EngineError::AlreadyExists(_))
    ));
}

#[test]
fn test_engine_not_running_errors() {
    let engine = AudioEngine::new(EngineConfig {
        device: Some("mock".into()),
        ..EngineConfig::default()
    })
    .unwrap();

    // Loading is allowed before start, playback is not.
    load_quiet(
        &engine,
        "s",
        Source::stereo(stereo_sine(4800, 440.0, 48000, 0.5), None),
    );
    assert!(matches!(
        engine.play("s", PlayOptions::default()),
        Err(EngineError::NotRunning)
    ));
    assert!(!engine.is_running());

    engine.start().unwrap();
    assert!(engine.is_running());
    engine.play("s", PlayOptions::default()).unwrap();

    engine.shutdown();
    assert!(!engine.is_running());
    assert!(matches!(
        engine.play("s", PlayOptions::default()),
        Err(EngineError::NotRunning)
    ));
    assert!(matches!(
        engine.load_track(
            "x",
            Source::stereo(vec![0.0; 96], None),
            LoadOptions::new()
        ),
        Err(EngineError::NotRunning)
    ));
}

#[test]
fn test_on_complete_fires_once_on_natural_end() {
    let engine = mock_engine(1024, 2);
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cb = fired.clone();
    let successes = Arc::new(Mutex::new(Vec::new()));
    let successes_cb = successes.clone();

    engine
        .load_track(
            "short",
            Source::stereo(stereo_sine(4800, 440.0, 48000, 0.5), None),
            LoadOptions {
                auto_normalize: false,
                on_complete: Some(Box::new(move |id, success, error| {
                    assert_eq!(id, "short");
                    assert!(error.is_none());
                    fired_cb.fetch_add(1, Ordering::SeqCst);
                    successes_cb.lock().unwrap().push(success);
                })),
                ..LoadOptions::new()
            },
        )
        .unwrap();

    engine.play("short", PlayOptions::default()).unwrap();
    let handle = engine.mock_handle();
    handle.render(8192);

    eventually(
        || fired.load(Ordering::SeqCst) == 1,
        "on_complete was not delivered",
    );
    assert_eq!(*successes.lock().unwrap(), vec![true]);

    // The claim clears, so the track can be replayed.
    eventually(
        || !engine.get_track_info("short").unwrap().playing,
        "track never returned to idle",
    );
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_position_callback_precision() {
    // B=480 (10 ms) pumped at real-time pace; the 0.5s callback must fire
    // exactly once within 20 ms of the target.
    let engine = mock_engine(480, 2);
    load_quiet(
        &engine,
        "pos",
        Source::stereo(stereo_sine(96000, 440.0, 48000, 0.5), None),
    );

    let hits = Arc::new(Mutex::new(Vec::new()));
    let hits_cb = hits.clone();
    engine
        .register_position_callback(
            "pos",
            0.5,
            Box::new(move |id, target, actual| {
                assert_eq!(id, "pos");
                assert_eq!(target, 0.5);
                hits_cb.lock().unwrap().push(actual);
            }),
            Some(0.015),
        )
        .unwrap();

    engine.play("pos", PlayOptions::default()).unwrap();
    let handle = engine.mock_handle();
    for _ in 0..80 {
        handle.render(480);
        spin_sleep::sleep(Duration::from_millis(10));
    }

    let hits = hits.lock().unwrap();
    assert_eq!(hits.len(), 1, "callback fired {} times", hits.len());
    assert!(
        (hits[0] - 0.5).abs() <= 0.020,
        "actual position was {}",
        hits[0]
    );

    let stats = engine.get_position_callback_stats();
    assert_eq!(stats.triggered, 1);
    assert!(stats.avg_precision_ms <= 20.0);
}

#[test]
fn test_global_position_listener() {
    let engine = mock_engine(480, 2);
    load_quiet(
        &engine,
        "g",
        Source::stereo(stereo_sine(96000, 440.0, 48000, 0.5), None),
    );

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks_cb = ticks.clone();
    let listener = engine.add_global_position_listener(Box::new(move |id, _pos| {
        assert_eq!(id, "g");
        ticks_cb.fetch_add(1, Ordering::SeqCst);
    }));

    engine.play("g", PlayOptions::default()).unwrap();
    let handle = engine.mock_handle();
    for _ in 0..10 {
        handle.render(480);
        spin_sleep::sleep(Duration::from_millis(10));
    }
    eventually(
        || ticks.load(Ordering::SeqCst) > 0,
        "global listener never ticked",
    );

    assert!(engine.remove_global_position_listener(listener));
    let count = ticks.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), count);
}

#[test]
fn test_match_loudness_rms() {
    let engine = mock_engine(1024, 2);
    load_quiet(
        &engine,
        "loud",
        Source::stereo(stereo_sine(48000, 440.0, 48000, 0.8), None),
    );
    load_quiet(
        &engine,
        "quiet",
        Source::stereo(stereo_sine(48000, 880.0, 48000, 0.2), None),
    );

    let (loud_vol, quiet_vol) =
        engine.match_loudness("loud", "quiet", 0.5, LoudnessMethod::Rms).unwrap();
    // RMS of a sine is amplitude * 0.707.
    assert!((loud_vol - 0.5 / (0.8 * 0.707)).abs() < 0.02, "{}", loud_vol);
    assert_eq!(quiet_vol, 2.0, "quiet volume should clamp at max");

    // Unknown plug-in methods fall back to RMS.
    let (fallback, _) = engine
        .match_loudness("loud", "quiet", 0.5, LoudnessMethod::Lufs)
        .unwrap();
    assert!((fallback - loud_vol).abs() < 1e-6);
}

#[test]
fn test_crossfade_hands_over_within_duration() {
    let engine = mock_engine(1024, 2);
    load_quiet(
        &engine,
        "from",
        Source::stereo(stereo_sine(480000, 440.0, 48000, 0.4), None),
    );
    load_quiet(
        &engine,
        "to",
        Source::stereo(stereo_sine(480000, 880.0, 48000, 0.4), None),
    );

    engine
        .play(
            "from",
            PlayOptions {
                volume: Some(0.5),
                ..Default::default()
            },
        )
        .unwrap();
    let handle = engine.mock_handle();
    handle.render(4096);

    engine
        .crossfade("from", "to", 0.1, CrossfadeOptions::default())
        .unwrap();

    // Matched volume: equal-loudness sources hand over the outgoing gain.
    let to_volume = engine.get_track_info("to").unwrap().volume;
    assert!((to_volume - 0.5).abs() < 0.02, "to volume was {}", to_volume);

    // Render past the fade; the outgoing track idles, the incoming plays.
    handle.render(9600);
    eventually(
        || !engine.get_track_info("from").unwrap().playing,
        "crossfade source never stopped",
    );
    assert!(engine.get_track_info("to").unwrap().playing);
    assert!(engine.get_position("from").unwrap() == 0.0);

    let peak = peak_of(&handle.render(4096));
    assert!((peak - 0.4 * 0.5).abs() < 0.05, "post-fade peak {}", peak);
}

#[test]
fn test_streaming_track_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.wav");
    let frames = 48000usize;
    // Strictly positive ramp so silence is distinguishable from audio.
    let samples: Vec<f32> = (0..frames)
        .map(|i| 0.1 + 0.8 * i as f32 / frames as f32)
        .collect();
    write_wav_f32(&path, &samples, 1, 48000);

    let engine = AudioEngine::new(EngineConfig {
        buffer_size: 480,
        channels: 1,
        device: Some("mock".into()),
        ..EngineConfig::default()
    })
    .unwrap();
    engine.start().unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let done_cb = done.clone();
    engine
        .load_track(
            "disk",
            Source::file(&path),
            LoadOptions {
                mode: LoadMode::Stream,
                auto_normalize: false,
                on_complete: Some(Box::new(move |_, success, _| {
                    assert!(success);
                    done_cb.fetch_add(1, Ordering::SeqCst);
                })),
                ..LoadOptions::new()
            },
        )
        .unwrap();
    assert!(engine.get_track_info("disk").unwrap().streaming);

    engine.play("disk", PlayOptions::default()).unwrap();
    let handle = engine.mock_handle();

    // Pump slightly slower than real time so the loader keeps up; collect
    // everything until the stream ends.
    let mut collected = Vec::new();
    for _ in 0..150 {
        collected.extend_from_slice(&handle.render(480));
        spin_sleep::sleep(Duration::from_millis(11));
        if done.load(Ordering::SeqCst) > 0 {
            break;
        }
    }
    eventually(
        || done.load(Ordering::SeqCst) == 1,
        "stream never reported completion",
    );

    // Strip the seek/warmup latency, then the audio must be the file's
    // samples in order with no interior dropouts.
    let first_audio = collected
        .iter()
        .position(|&s| s != 0.0)
        .expect("no audio produced");
    let audio = &collected[first_audio..];
    let audible = audio.iter().take_while(|&&s| s != 0.0).count();
    assert!(audible > frames / 2, "only {} audible frames", audible);
    for (i, sample) in audio[..audible].iter().enumerate() {
        let expected = 0.1 + 0.8 * i as f32 / frames as f32;
        assert!(
            (sample - expected).abs() < 1e-3,
            "frame {} was {} expected {}",
            i,
            sample,
            expected
        );
    }
}

#[test]
fn test_track_info_reports_rates() {
    let engine = mock_engine(1024, 2);
    load_quiet(
        &engine,
        "i",
        Source::mono(mono_sine(44100, 440.0, 44100, 0.5), Some(44100)),
    );

    let info = engine.get_track_info("i").unwrap();
    assert_eq!(info.id, "i");
    assert_eq!(info.sample_rate, 44100);
    assert_eq!(info.engine_sample_rate, 48000);
    assert!((info.sample_rate_ratio - 0.91875).abs() < 1e-9);
    assert!((info.duration - 1.0).abs() < 1e-6);
    assert!(!info.playing && !info.paused && !info.muted && !info.streaming);
    assert_eq!(info.speed, 1.0);
}

#[test]
fn test_auto_normalize_scales_peak() {
    let engine = mock_engine(1024, 2);
    engine
        .load_track(
            "n",
            Source::stereo(stereo_sine(48000, 440.0, 48000, 0.25), None),
            LoadOptions::new(),
        )
        .unwrap();

    engine.play("n", PlayOptions::default()).unwrap();
    let peak = peak_of(&engine.mock_handle().render(24000));
    assert!((peak - 0.95).abs() < 0.01, "normalized peak was {}", peak);
}

#[test]
fn test_speed_doubles_consumption() {
    let engine = mock_engine(1024, 2);
    load_quiet(
        &engine,
        "fast",
        Source::stereo(stereo_sine(96000, 440.0, 48000, 0.5), None),
    );

    engine.play("fast", PlayOptions::default()).unwrap();
    engine.set_speed("fast", 2.0).unwrap();
    let handle = engine.mock_handle();
    handle.render(4800);

    // 4800 output frames at speed 2 advance the source by ~9600 frames.
    let position = engine.get_position("fast").unwrap();
    assert!((position - 0.2).abs() < 0.022, "position was {}", position);

    assert!(matches!(
        engine.set_speed("fast", 9.0),
        Err(EngineError::InvalidArgument(_))
    ));
}
