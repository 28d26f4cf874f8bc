//! Parameter observer: turns the DAW's raw value-listen firehose into a
//! bounded history of discrete changes.
//!
//! The DAW streams values at high rate while a knob is moving. Each
//! notification cancels the parameter's pending commit and schedules a new
//! one a debounce window later, so a burst collapses into a single
//! [`ParameterChange`] from the value before the burst to the last value
//! notified. The first notification after a subscribe is synthetic (the DAW
//! echoes the current value) and is dropped.
//!
//! Commits carry both a monotonic instant (window eviction) and wall-clock
//! millis (the wire). The history window is applied at read time, never by a
//! background sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use liveosc::{LiveBridge, MixerSnapshot, ParamKey, ParameterUpdate};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::SessionEvent;

/// One committed, immutable parameter change.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterChange {
    pub track_id: u32,
    pub device_id: u32,
    pub param_id: u32,
    pub track_name: String,
    pub device_name: String,
    pub param_name: String,
    pub old_value: f32,
    pub new_value: f32,
    pub min: f32,
    pub max: f32,
    pub timestamp_ms: i64,
    #[serde(skip)]
    pub at: Instant,
}

#[cfg(test)]
impl ParameterChange {
    pub(crate) fn sample() -> Self {
        Self {
            track_id: 1,
            device_id: 1,
            param_id: 5,
            track_name: "Bass".to_string(),
            device_name: "Op".to_string(),
            param_name: "Filter Freq".to_string(),
            old_value: 0.25,
            new_value: 0.75,
            min: 0.0,
            max: 1.0,
            timestamp_ms: Utc::now().timestamp_millis(),
            at: Instant::now(),
        }
    }
}

/// Per-parameter bookkeeping. Lives exactly as long as its snapshot's
/// subscription.
struct Observation {
    /// Last committed value (the snapshot value until the first commit).
    value: f32,
    /// Latest notified value, promoted to `value` on commit.
    latest: f32,
    /// True until the synthetic post-subscribe notification has been eaten.
    initial: bool,
    /// Bumped on every schedule; a commit only lands if its generation is
    /// still current.
    generation: u64,
    pending: Option<JoinHandle<()>>,
    track_name: String,
    device_name: String,
    param_name: String,
    min: f32,
    max: f32,
}

struct Inner {
    bridge: Arc<LiveBridge>,
    window: Duration,
    debounce: Duration,
    events: broadcast::Sender<SessionEvent>,
    observations: Mutex<HashMap<ParamKey, Observation>>,
    history: Mutex<Vec<ParameterChange>>,
}

/// Per-session observer over the shared bridge.
pub struct ParameterObserver {
    inner: Arc<Inner>,
}

impl ParameterObserver {
    pub fn new(
        bridge: Arc<LiveBridge>,
        window: Duration,
        debounce: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bridge,
                window,
                debounce,
                events,
                observations: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Drop any existing subscriptions and subscribe every parameter in the
    /// snapshot. Progress runs 50 -> 100, one milestone per track.
    ///
    /// On failure the partial subscription is rolled back and the error
    /// returned; history is never touched.
    pub async fn resubscribe(
        &self,
        snapshot: &MixerSnapshot,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<(), liveosc::OscError> {
        self.unsubscribe_all().await;

        let total_tracks = snapshot.tracks.len();
        if total_tracks == 0 {
            progress(100);
            return Ok(());
        }

        let mut subscribed: Vec<ParamKey> = Vec::new();
        for (i, track) in snapshot.tracks.iter().enumerate() {
            for device in &track.devices {
                for param in &device.parameters {
                    let key = ParamKey::new(track.track_id, device.device_id, param.param_id);
                    {
                        let mut map = self.inner.observations.lock().unwrap();
                        map.insert(
                            key,
                            Observation {
                                value: param.value,
                                latest: param.value,
                                initial: true,
                                generation: 0,
                                pending: None,
                                track_name: track.name.clone(),
                                device_name: device.name.clone(),
                                param_name: param.name.clone(),
                                min: param.min,
                                max: param.max,
                            },
                        );
                    }
                    if let Err(e) = self.inner.bridge.start_listen(key).await {
                        warn!("subscribe failed at {}, rolling back: {}", key, e);
                        self.rollback(&subscribed, key).await;
                        return Err(e);
                    }
                    subscribed.push(key);
                }
            }
            progress((50 + 50 * (i + 1) / total_tracks) as u8);
        }

        debug!("observing {} parameters", subscribed.len());
        Ok(())
    }

    async fn rollback(&self, subscribed: &[ParamKey], failed: ParamKey) {
        for key in subscribed {
            let _ = self.inner.bridge.stop_listen(*key).await;
        }
        let mut map = self.inner.observations.lock().unwrap();
        for key in subscribed {
            map.remove(key);
        }
        map.remove(&failed);
    }

    /// Best-effort teardown of every subscription. History is retained so a
    /// reindex does not wipe the user's recent-changes view.
    pub async fn unsubscribe_all(&self) {
        let retired = {
            let mut map = self.inner.observations.lock().unwrap();
            std::mem::take(&mut *map)
        };
        for (key, obs) in retired {
            if let Some(handle) = obs.pending {
                handle.abort();
            }
            if let Err(e) = self.inner.bridge.stop_listen(key).await {
                debug!("stop_listen for {} failed during teardown: {}", key, e);
            }
        }
    }

    /// Spawn the notification pump. One per session; consumes the push
    /// subscription for the life of the session.
    pub fn spawn_pump(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut updates = self.inner.bridge.parameter_updates();
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                Inner::apply(&inner, update);
            }
        })
    }

    /// Feed one notification through the debounce machinery.
    pub fn apply_update(&self, update: ParameterUpdate) {
        Inner::apply(&self.inner, update);
    }

    /// Changes still inside the window, oldest first. Eviction happens here,
    /// at read time.
    pub fn recent_changes(&self) -> Vec<ParameterChange> {
        let now = Instant::now();
        let mut history = self.inner.history.lock().unwrap();
        history.retain(|c| now.duration_since(c.at) <= self.inner.window);
        history.clone()
    }

    pub fn observation_count(&self) -> usize {
        self.inner.observations.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn history_len(&self) -> usize {
        self.inner.history.lock().unwrap().len()
    }
}

impl Inner {
    fn apply(inner: &Arc<Inner>, update: ParameterUpdate) {
        let mut map = inner.observations.lock().unwrap();
        let Some(obs) = map.get_mut(&update.key) else {
            // Notification for a retired snapshot.
            return;
        };

        if obs.initial {
            // The DAW echoes the current value once per subscribe; that echo
            // is not a user change.
            obs.initial = false;
            return;
        }

        if update.value == obs.value {
            return;
        }

        if let Some(handle) = obs.pending.take() {
            handle.abort();
        }

        obs.latest = update.value;
        obs.generation += 1;
        let generation = obs.generation;
        let key = update.key;
        let debounce = inner.debounce;
        let task_inner = inner.clone();
        obs.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            task_inner.commit(key, generation);
        }));
    }

    fn commit(&self, key: ParamKey, generation: u64) {
        let change = {
            let mut map = self.observations.lock().unwrap();
            let Some(obs) = map.get_mut(&key) else {
                return;
            };
            if obs.generation != generation {
                // A newer notification superseded this commit.
                return;
            }
            obs.pending = None;
            let change = ParameterChange {
                track_id: key.track,
                device_id: key.device,
                param_id: key.param,
                track_name: obs.track_name.clone(),
                device_name: obs.device_name.clone(),
                param_name: obs.param_name.clone(),
                old_value: obs.value,
                new_value: obs.latest,
                min: obs.min,
                max: obs.max,
                timestamp_ms: Utc::now().timestamp_millis(),
                at: Instant::now(),
            };
            obs.value = obs.latest;
            change
        };

        self.history.lock().unwrap().push(change.clone());
        let _ = self.events.send(SessionEvent::ParameterChange { change });
    }
}
