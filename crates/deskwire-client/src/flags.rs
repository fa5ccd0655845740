//! Named boolean feature flags with change notification.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use deskwire_settings::FeatureSettings;

const CHANGE_BUFFER: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagChange {
    pub flag: String,
    pub enabled: bool,
}

/// Unknown flags read as disabled.
pub struct FeatureFlagStore {
    flags: RwLock<HashMap<String, bool>>,
    changes: broadcast::Sender<FlagChange>,
}

impl Default for FeatureFlagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureFlagStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            flags: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn from_settings(settings: &FeatureSettings) -> Self {
        let store = Self::new();
        store
            .flags
            .write()
            .extend(settings.0.iter().map(|(k, v)| (k.clone(), *v)));
        store
    }

    pub fn is_enabled(&self, flag: &str) -> bool {
        self.flags.read().get(flag).copied().unwrap_or(false)
    }

    pub fn enable(&self, flag: &str) -> bool {
        self.set(flag, true)
    }

    pub fn disable(&self, flag: &str) -> bool {
        self.set(flag, false)
    }

    /// Returns whether the value changed. Subscribers hear only real changes.
    pub fn set(&self, flag: &str, enabled: bool) -> bool {
        let previous = self.flags.write().insert(flag.to_string(), enabled);
        let changed = previous.unwrap_or(false) != enabled;
        if changed {
            info!(flag, enabled, "feature flag changed");
            // No receivers is fine.
            let _ = self.changes.send(FlagChange {
                flag: flag.to_string(),
                enabled,
            });
        }
        changed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlagChange> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.flags
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskwire_settings::INCREMENTAL_UPDATES;

    #[test]
    fn unknown_flags_are_disabled() {
        let store = FeatureFlagStore::new();
        assert!(!store.is_enabled("nope"));
    }

    #[test]
    fn seeded_from_settings() {
        let mut settings = FeatureSettings::default();
        settings.set(INCREMENTAL_UPDATES, true);
        let store = FeatureFlagStore::from_settings(&settings);
        assert!(store.is_enabled(INCREMENTAL_UPDATES));
        assert_eq!(store.snapshot().get(INCREMENTAL_UPDATES), Some(&true));
    }

    #[test]
    fn notifies_only_on_change() {
        let store = FeatureFlagStore::new();
        let mut rx = store.subscribe();

        assert!(store.enable(INCREMENTAL_UPDATES));
        assert!(!store.enable(INCREMENTAL_UPDATES));
        assert!(store.disable(INCREMENTAL_UPDATES));
        assert!(!store.disable(INCREMENTAL_UPDATES));
        assert!(!store.disable("never-set"));

        assert_eq!(
            rx.try_recv().unwrap(),
            FlagChange {
                flag: INCREMENTAL_UPDATES.into(),
                enabled: true
            }
        );
        assert!(!rx.try_recv().unwrap().enabled);
        assert!(rx.try_recv().is_err());
    }
}
