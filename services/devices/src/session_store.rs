//! Per-device session persistence
//!
//! Layout: `<root>/<normalized number>/creds.json` holds the protocol
//! credentials and `device_config.json` holds the [`DeviceConfig`] used to
//! rehydrate the session after a restart.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::models::DeviceConfig;
use crate::protocol::Credentials;

pub const CREDENTIALS_FILE: &str = "creds.json";
pub const DEVICE_CONFIG_FILE: &str = "device_config.json";

/// Location of one persisted session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub dir: PathBuf,
}

impl SessionHandle {
    pub fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(DEVICE_CONFIG_FILE)
    }

    /// Directory name, which is the normalized phone number
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Filesystem-backed session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open the store, creating the root directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_for(&self, phone_number: &str) -> SessionHandle {
        SessionHandle {
            dir: self.root.join(phone_number),
        }
    }

    /// Ensure the session directory exists and write the device descriptor
    ///
    /// With `force_new` any previous session for the number is discarded first.
    pub async fn prepare(
        &self,
        config: &DeviceConfig,
        force_new: bool,
    ) -> Result<SessionHandle, DeviceError> {
        let session = self.session_for(&config.phone_number);

        if force_new {
            self.discard(&session).await?;
        }
        fs::create_dir_all(&session.dir).await?;

        let mut descriptor = config.clone();
        descriptor.auth_path = Some(session.dir.to_string_lossy().into_owned());
        write_atomic(&session.config_path(), &serde_json::to_vec_pretty(&descriptor)?).await?;

        debug!(device_id = %config.id, dir = %session.dir.display(), force_new, "Session prepared");
        Ok(session)
    }

    /// Stored credentials, if the device has paired before
    pub async fn load_credentials(
        &self,
        session: &SessionHandle,
    ) -> Result<Option<Credentials>, DeviceError> {
        match fs::read(session.credentials_path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, session: &SessionHandle) -> bool {
        fs::try_exists(&session.dir).await.unwrap_or(false)
    }

    pub async fn has_credentials(&self, session: &SessionHandle) -> bool {
        fs::try_exists(session.credentials_path())
            .await
            .unwrap_or(false)
    }

    /// Replace the credentials file atomically
    pub async fn persist_credentials(
        &self,
        session: &SessionHandle,
        credentials: &Credentials,
    ) -> Result<(), DeviceError> {
        fs::create_dir_all(&session.dir).await?;
        write_atomic(&session.credentials_path(), &serde_json::to_vec(credentials)?).await
    }

    pub async fn load_device_config(
        &self,
        session: &SessionHandle,
    ) -> Result<DeviceConfig, DeviceError> {
        let bytes = fs::read(session.config_path()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Check both artifacts exist and return the descriptor
    pub async fn validate(&self, session: &SessionHandle) -> Result<DeviceConfig, DeviceError> {
        for (path, what) in [
            (session.credentials_path(), CREDENTIALS_FILE),
            (session.config_path(), DEVICE_CONFIG_FILE),
        ] {
            if !fs::try_exists(&path).await.unwrap_or(false) {
                return Err(DeviceError::SessionInvalid(
                    session.name(),
                    format!("missing {what}"),
                ));
            }
        }

        self.load_device_config(session)
            .await
            .map_err(|e| DeviceError::SessionInvalid(session.name(), e.to_string()))
    }

    /// Remove the session directory; missing sessions are not an error
    pub async fn delete(&self, session: &SessionHandle) -> Result<(), DeviceError> {
        match fs::remove_dir_all(&session.dir).await {
            Ok(()) => {
                info!(dir = %session.dir.display(), "Session deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every session directory under the root
    pub async fn list_sessions(&self) -> Result<Vec<SessionHandle>, DeviceError> {
        let mut sessions = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !entry.file_type().await?.is_dir() {
                continue;
            }
            sessions.push(SessionHandle { dir: entry.path() });
        }

        sessions.sort_by(|a, b| a.dir.cmp(&b.dir));
        Ok(sessions)
    }

    /// Move the old session out of the way, then remove it
    async fn discard(&self, session: &SessionHandle) -> Result<(), DeviceError> {
        let trash = self
            .root
            .join(format!(".{}.discarded-{}", session.name(), uuid::Uuid::new_v4()));

        match fs::rename(&session.dir, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = fs::remove_dir_all(&trash).await {
            warn!(dir = %trash.display(), error = %e, "Failed to remove discarded session");
        }
        Ok(())
    }
}

/// Write to a sibling temp file, sync, then rename over the target
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DeviceError> {
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}
