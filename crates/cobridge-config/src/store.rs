// ── Persisted device state ──
//
// One JSON file per device id. Writes go through a temporary file and a
// rename so a crash never leaves a half-written state file behind.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use cobridge_core::{PersistedState, SaveCallback};

use crate::ConfigError;

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, device_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{device_id}.json"))
    }

    /// Read the state saved for `device_id`. A missing file is `Ok(None)`.
    pub fn load(&self, device_id: &Uuid) -> Result<Option<PersistedState>, ConfigError> {
        let path = self.path_for(device_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&bytes)
            .map_err(|source| ConfigError::State { path, source })?;
        Ok(Some(state))
    }

    pub fn save(&self, device_id: &Uuid, state: &PersistedState) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(device_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(state).map_err(|source| ConfigError::State {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        debug!(device = %device_id, path = %path.display(), "state saved");
        Ok(())
    }

    pub fn remove(&self, device_id: &Uuid) -> Result<(), ConfigError> {
        match std::fs::remove_file(self.path_for(device_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// A save callback for one device's cloud manager. Write failures are
    /// logged; the manager keeps running on its in-memory state.
    pub fn save_callback(&self, device_id: Uuid) -> SaveCallback {
        let store = self.clone();
        Arc::new(move |state: &PersistedState| {
            if let Err(e) = store.save(&device_id, state) {
                warn!(device = %device_id, error = %e, "failed to persist cloud state");
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use cobridge_core::{CloudConfiguration, CredentialsRecord, ProvisioningStatus};

    use super::*;

    fn sample() -> PersistedState {
        PersistedState {
            configuration: CloudConfiguration {
                url: "coap://cloud.example".into(),
                cloud_id: "cloud-1".into(),
                authorization_provider: "github".into(),
                provisioning_status: ProvisioningStatus::Registered,
                ..CloudConfiguration::default()
            },
            credentials: CredentialsRecord {
                access_token: "T1".into(),
                user_id: "user-1".into(),
                refresh_token: "R1".into(),
                expires_in: 3600,
                valid_until: None,
            },
        }
    }

    #[test]
    fn missing_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.load(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));
        let id = Uuid::new_v4();

        store.save(&id, &sample()).unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(sample()));
        assert!(!store.path_for(&id).with_extension("json.tmp").exists());
    }

    #[test]
    fn callback_writes_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let id = Uuid::new_v4();
        let save = store.save_callback(id);

        save(&PersistedState::default());
        save(&sample());
        assert_eq!(store.load(&id).unwrap().unwrap().credentials.access_token, "T1");
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let id = Uuid::new_v4();
        std::fs::write(store.path_for(&id), b"{ not json").unwrap();

        let err = store.load(&id).unwrap_err();
        assert!(matches!(err, ConfigError::State { .. }));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let id = Uuid::new_v4();
        store.save(&id, &sample()).unwrap();
        store.remove(&id).unwrap();
        store.remove(&id).unwrap();
        assert!(store.load(&id).unwrap().is_none());
    }
}
