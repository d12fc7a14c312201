//! A thread-safe holder for the currently active project configuration.
//! Readers (decision calls) take a snapshot; writers (the datafile poller)
//! replace the whole configuration atomically.
use std::sync::{Arc, RwLock};

use crate::datafile::ProjectConfig;

/// `ConfigStore` provides thread-safe (`Sync`) storage for the active
/// configuration with concurrent access for readers and writers.
///
/// The configuration itself is immutable and can only be replaced fully, so
/// every decision executes against a single consistent snapshot.
#[derive(Default)]
pub struct ConfigStore {
    config: RwLock<Option<Arc<ProjectConfig>>>,
}

impl ConfigStore {
    pub fn new() -> ConfigStore {
        ConfigStore::default()
    }

    /// Take a snapshot of the active configuration. `None` until the first
    /// datafile lands.
    pub fn get_config(&self) -> Option<Arc<ProjectConfig>> {
        // self.config.read() should always return Ok(). Err() is possible
        // only if the lock is poisoned (writer panicked while holding the
        // lock), which should never happen.
        self.config
            .read()
            .expect("thread holding configuration lock should not panic")
            .clone()
    }

    /// Publish a new configuration.
    pub fn set_config(&self, config: Arc<ProjectConfig>) {
        let mut slot = self
            .config
            .write()
            .expect("thread holding configuration lock should not panic");
        *slot = Some(config);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ConfigStore;
    use crate::datafile::ProjectConfig;

    const DATAFILE: &str =
        r#"{"version": "4", "accountId": "1", "projectId": "2", "revision": "3"}"#;

    #[test]
    fn starts_empty() {
        assert!(ConfigStore::new().get_config().is_none());
    }

    #[test]
    fn can_set_config_from_another_thread() {
        let store = Arc::new(ConfigStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                let config = ProjectConfig::parse(DATAFILE).unwrap();
                store.set_config(Arc::new(config));
            })
            .join();
        }

        assert_eq!(store.get_config().unwrap().revision, "3");
    }
}
