//! Mixer mirror: the session's local copy of the DAW's mixer tree.
//!
//! Readers clone an `Arc` to the current snapshot and keep a consistent view
//! for as long as they hold it. Writers replace the snapshot wholesale; there
//! are no partial updates, so a failed reindex leaves the previous snapshot
//! untouched.

use std::sync::{Arc, RwLock};

use liveosc::{MixerSnapshot, ParamKey, Parameter};

#[derive(Default)]
pub struct MixerMirror {
    snapshot: RwLock<Option<Arc<MixerSnapshot>>>,
}

impl MixerMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot, if an attach has completed.
    pub fn load(&self) -> Option<Arc<MixerSnapshot>> {
        self.snapshot.read().unwrap().clone()
    }

    /// Atomically publish a new snapshot.
    pub fn replace(&self, snapshot: MixerSnapshot) {
        *self.snapshot.write().unwrap() = Some(Arc::new(snapshot));
    }

    pub fn is_indexed(&self) -> bool {
        self.snapshot.read().unwrap().is_some()
    }

    /// Convenience lookup straight off the current snapshot.
    pub fn parameter(&self, key: ParamKey) -> Option<Parameter> {
        self.load()?.parameter(key).cloned()
    }
}
