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

//! Position-callback watcher.
//!
//! A background thread polls track positions and fires registered callbacks
//! when a target time is reached within tolerance. The poll interval adapts:
//! it narrows when a registration is about to fire and widens when there is
//! nothing to watch. Handlers run on the watcher thread, never on the audio
//! thread; registration state is copied under the lock and handlers invoked
//! outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::track::TrackShared;

/// Default poll interval.
const POLL_DEFAULT: Duration = Duration::from_millis(5);
/// Poll interval when no registrations or listeners exist.
const POLL_IDLE: Duration = Duration::from_millis(20);
/// Poll interval when a registration is within the hot window of its target.
const POLL_HOT: Duration = Duration::from_millis(2);
/// How close (in seconds) a target must be to trigger hot polling.
const HOT_WINDOW_SECONDS: f64 = 0.05;
/// Trigger precision samples kept for the rolling average.
const PRECISION_WINDOW: usize = 64;

/// Handler for one position registration: (track id, target seconds, actual
/// seconds at trigger time).
pub type PositionHandler = Box<dyn FnMut(&str, f64, f64) + Send>;

/// Listener invoked on every watcher tick for every active track:
/// (track id, position seconds).
pub type GlobalListener = Box<dyn FnMut(&str, f64) + Send>;

/// Token returned by add_global_position_listener, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(pub(crate) u64);

/// Statistics for the position-callback subsystem.
#[derive(Debug, Clone)]
pub struct PositionCallbackStats {
    /// Registrations still armed.
    pub active_registrations: usize,
    /// Total registrations fired.
    pub triggered: u64,
    /// Registrations whose window was overshot without firing.
    pub missed: u64,
    /// Rolling average |actual - target| of recent triggers, in milliseconds.
    pub avg_precision_ms: f64,
}

struct Registration {
    track_id: String,
    target: f64,
    tolerance: f64,
    handler: Arc<Mutex<PositionHandler>>,
    armed: bool,
}

/// State shared between the engine handle and the watcher thread.
pub(crate) struct WatcherShared {
    /// Tracks visible to the watcher, mirroring the engine's track map.
    tracks: RwLock<HashMap<String, Arc<TrackShared>>>,
    registrations: Mutex<Vec<Registration>>,
    listeners: Mutex<Vec<(u64, Arc<Mutex<GlobalListener>>)>>,
    next_listener: AtomicU64,
    shutdown: AtomicBool,
    triggered: AtomicU64,
    missed: AtomicU64,
    precision_ms: Mutex<VecDeque<f64>>,
}

impl WatcherShared {
    pub fn new() -> WatcherShared {
        WatcherShared {
            tracks: RwLock::new(HashMap::new()),
            registrations: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            triggered: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            precision_ms: Mutex::new(VecDeque::with_capacity(PRECISION_WINDOW)),
        }
    }

    pub fn track_added(&self, shared: Arc<TrackShared>) {
        self.tracks.write().insert(shared.id.clone(), shared);
    }

    /// Removes the track and every registration attached to it.
    pub fn track_removed(&self, id: &str) {
        self.tracks.write().remove(id);
        self.registrations.lock().retain(|r| r.track_id != id);
    }

    /// Registers a callback, replacing any registration with the same
    /// (track, target) key.
    pub fn register(&self, track_id: &str, target: f64, tolerance: f64, handler: PositionHandler) {
        let mut registrations = self.registrations.lock();
        registrations.retain(|r| !(r.track_id == track_id && r.target == target));
        registrations.push(Registration {
            track_id: track_id.to_string(),
            target,
            tolerance,
            handler: Arc::new(Mutex::new(handler)),
            armed: true,
        });
        debug!(track = track_id, target, tolerance, "Position callback registered.");
    }

    pub fn remove(&self, track_id: &str, target: f64) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| !(r.track_id == track_id && r.target == target));
        registrations.len() != before
    }

    pub fn clear_registrations(&self) {
        self.registrations.lock().clear();
    }

    pub fn add_listener(&self, listener: GlobalListener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .push((id, Arc::new(Mutex::new(listener))));
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id.0);
        listeners.len() != before
    }

    pub fn stats(&self) -> PositionCallbackStats {
        let precision = self.precision_ms.lock();
        let avg = if precision.is_empty() {
            0.0
        } else {
            precision.iter().sum::<f64>() / precision.len() as f64
        };
        PositionCallbackStats {
            active_registrations: self.registrations.lock().iter().filter(|r| r.armed).count(),
            triggered: self.triggered.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            avg_precision_ms: avg,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn record_precision(&self, error_ms: f64) {
        let mut precision = self.precision_ms.lock();
        if precision.len() == PRECISION_WINDOW {
            precision.pop_front();
        }
        precision.push_back(error_ms);
    }
}

/// Spawns the watcher thread. It exits when `WatcherShared::shutdown` is
/// called.
pub(crate) fn spawn_watcher(shared: Arc<WatcherShared>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rtmix-watcher".into())
        .spawn(move || {
            info!("Position watcher started.");
            watcher_loop(&shared);
            info!("Position watcher stopped.");
        })
}

fn watcher_loop(shared: &WatcherShared) {
    // Reused between ticks to avoid re-allocating every few milliseconds.
    let mut positions: Vec<(String, f64, bool)> = Vec::new();
    let mut due: Vec<(Arc<Mutex<PositionHandler>>, String, f64, f64)> = Vec::new();

    while !shared.shutdown.load(Ordering::Acquire) {
        positions.clear();
        {
            let tracks = shared.tracks.read();
            for (id, track) in tracks.iter() {
                positions.push((
                    id.clone(),
                    track.position_seconds(),
                    track.state().is_active(),
                ));
            }
        }

        let mut hot = false;
        due.clear();
        {
            let mut registrations = shared.registrations.lock();
            for registration in registrations.iter_mut() {
                if !registration.armed {
                    continue;
                }
                let Some((_, position, active)) = positions
                    .iter()
                    .find(|(id, _, _)| *id == registration.track_id)
                else {
                    continue;
                };
                if !*active {
                    continue;
                }
                let position = *position;
                let lower = registration.target - registration.tolerance;
                let upper = registration.target + registration.tolerance;
                if position < lower {
                    if registration.target - position <= HOT_WINDOW_SECONDS {
                        hot = true;
                    }
                    continue;
                }
                registration.armed = false;
                if position <= upper {
                    shared.triggered.fetch_add(1, Ordering::Relaxed);
                    shared.record_precision((position - registration.target).abs() * 1000.0);
                    due.push((
                        registration.handler.clone(),
                        registration.track_id.clone(),
                        registration.target,
                        position,
                    ));
                } else {
                    // Overshot the window, e.g. a seek jumped past it.
                    shared.missed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        track = registration.track_id.as_str(),
                        target = registration.target,
                        position,
                        "Position callback window missed."
                    );
                }
            }
        }

        // Handlers run without holding the registry lock.
        for (handler, track_id, target, actual) in due.drain(..) {
            (&mut *handler.lock())(&track_id, target, actual);
        }

        let listeners: Vec<Arc<Mutex<GlobalListener>>> = {
            let listeners = shared.listeners.lock();
            listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        if !listeners.is_empty() {
            for (id, position, active) in positions.iter() {
                if !*active {
                    continue;
                }
                for listener in &listeners {
                    (&mut *listener.lock())(id, *position);
                }
            }
        }

        let idle = listeners.is_empty() && shared.registrations.lock().is_empty();
        let interval = if hot {
            POLL_HOT
        } else if idle {
            POLL_IDLE
        } else {
            POLL_DEFAULT
        };
        spin_sleep::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::eventually;
    use crate::track::TrackState;
    use std::sync::mpsc;

    fn track(id: &str, sample_rate: u32) -> Arc<TrackShared> {
        let shared = Arc::new(TrackShared::new(
            1,
            id.into(),
            sample_rate,
            1,
            sample_rate as u64 * 10,
            false,
            1.0,
            48000,
        ));
        shared.publish_state(TrackState::Playing);
        shared
    }

    #[test]
    fn test_callback_fires_once_within_tolerance() {
        let shared = Arc::new(WatcherShared::new());
        let t = track("a", 48000);
        shared.track_added(t.clone());

        let (tx, rx) = mpsc::channel();
        shared.register(
            "a",
            0.5,
            0.015,
            Box::new(move |id, target, actual| {
                tx.send((id.to_string(), target, actual)).unwrap();
            }),
        );

        let handle = spawn_watcher(shared.clone()).unwrap();

        // Walk the position forward ~2.4ms per step, like a playing track.
        for step in 0..600u64 {
            t.publish_position(step * 48000 / 600);
            std::thread::sleep(Duration::from_millis(1));
        }

        let (id, target, actual) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, "a");
        assert_eq!(target, 0.5);
        assert!((actual - 0.5).abs() <= 0.020, "actual was {}", actual);

        // Disarmed: no second fire.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        let stats = shared.stats();
        assert_eq!(stats.triggered, 1);
        assert_eq!(stats.active_registrations, 0);
        assert!(stats.avg_precision_ms <= 20.0);

        shared.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_no_fire_before_target_window() {
        let shared = Arc::new(WatcherShared::new());
        let t = track("a", 48000);
        shared.track_added(t.clone());

        let (tx, rx) = mpsc::channel();
        shared.register(
            "a",
            5.0,
            0.015,
            Box::new(move |_, _, actual| {
                tx.send(actual).unwrap();
            }),
        );

        let handle = spawn_watcher(shared.clone()).unwrap();
        t.publish_position(48000); // 1.0s, far before the 5.0s target
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        shared.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_overshoot_counts_as_missed() {
        let shared = Arc::new(WatcherShared::new());
        let t = track("a", 48000);
        shared.track_added(t.clone());

        let (tx, rx) = mpsc::channel();
        shared.register(
            "a",
            0.5,
            0.010,
            Box::new(move |_, _, actual| {
                tx.send(actual).unwrap();
            }),
        );

        let handle = spawn_watcher(shared.clone()).unwrap();
        // Jump straight past the window, as a seek would.
        t.publish_position(48000 * 2);

        eventually(|| shared.stats().missed == 1, "overshoot was not recorded");
        assert!(rx.try_recv().is_err());

        shared.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_global_listener_ticks_active_tracks() {
        let shared = Arc::new(WatcherShared::new());
        let playing = track("playing", 48000);
        shared.track_added(playing.clone());
        let idle = Arc::new(TrackShared::new(
            2, "idle".into(), 48000, 1, 480000, false, 1.0, 48000,
        ));
        shared.track_added(idle);

        let (tx, rx) = mpsc::channel();
        let listener_id = shared.add_listener(Box::new(move |id, pos| {
            tx.send((id.to_string(), pos)).unwrap();
        }));

        let handle = spawn_watcher(shared.clone()).unwrap();
        playing.publish_position(24000);

        let (id, pos) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, "playing");
        assert!(pos >= 0.0);

        assert!(shared.remove_listener(listener_id));
        assert!(!shared.remove_listener(listener_id));

        shared.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_registration_replacement_and_removal() {
        let shared = Arc::new(WatcherShared::new());
        shared.register("a", 1.0, 0.01, Box::new(|_, _, _| {}));
        shared.register("a", 1.0, 0.02, Box::new(|_, _, _| {}));
        shared.register("a", 2.0, 0.01, Box::new(|_, _, _| {}));
        assert_eq!(shared.stats().active_registrations, 2);

        assert!(shared.remove("a", 1.0));
        assert!(!shared.remove("a", 1.0));
        assert_eq!(shared.stats().active_registrations, 1);

        shared.clear_registrations();
        assert_eq!(shared.stats().active_registrations, 0);
    }

    #[test]
    fn test_unload_drops_registrations() {
        let shared = Arc::new(WatcherShared::new());
        let t = track("a", 48000);
        shared.track_added(t);
        shared.register("a", 1.0, 0.01, Box::new(|_, _, _| {}));
        shared.register("b", 1.0, 0.01, Box::new(|_, _, _| {}));

        shared.track_removed("a");
        assert_eq!(shared.stats().active_registrations, 1);
    }
}
