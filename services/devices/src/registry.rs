//! Registry of live device connections
//!
//! Every registration gets a fresh generation number. Event loops hold on to
//! the generation they were started with and only touch the entry while it
//! still matches, so a superseded connection can never clobber its successor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::DeviceError;
use crate::history::ChatHistoryStore;
use crate::models::{DeviceConfig, DeviceStatus, StatusReport};
use crate::protocol::ProtocolHandle;

/// One registered device
#[derive(Clone)]
pub struct DeviceEntry {
    pub config: DeviceConfig,
    pub handle: Option<Arc<dyn ProtocolHandle>>,
    pub connected: bool,
    pub last_error: Option<String>,
    pub pending_pairing: Option<String>,
    pub generation: u64,
}

impl DeviceEntry {
    pub fn new(config: DeviceConfig, handle: Arc<dyn ProtocolHandle>, generation: u64) -> Self {
        Self {
            config,
            handle: Some(handle),
            connected: false,
            last_error: None,
            pending_pairing: None,
            generation,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            user_id: self.config.owner_user_id.clone(),
            whatsapp_number: self.config.phone_number.clone(),
            connected: self.connected,
            error: self.last_error.clone(),
            auth_path: self.config.auth_path.clone(),
            awaiting_pairing: self.pending_pairing.is_some(),
        }
    }
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceEntry>>>,
    generations: Arc<AtomicU64>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert or replace an entry, returning the previous one
    pub async fn register(&self, entry: DeviceEntry) -> Option<DeviceEntry> {
        debug!(device_id = %entry.config.id, generation = entry.generation, "Registering device");
        self.devices
            .write()
            .await
            .insert(entry.config.id.clone(), entry)
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceEntry> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn is_current(&self, device_id: &str, generation: u64) -> bool {
        self.devices
            .read()
            .await
            .get(device_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Apply `f` to the entry if it still belongs to `generation`
    pub async fn update<F>(&self, device_id: &str, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(entry) if entry.generation == generation => {
                f(entry);
                true
            }
            _ => false,
        }
    }

    /// Flip the connected flag of the entry owned by `generation`
    ///
    /// Any pending pairing code is dropped, since it can no longer be scanned.
    pub async fn set_connected(&self, device_id: &str, generation: u64, connected: bool) -> bool {
        self.update(device_id, generation, |entry| {
            entry.connected = connected;
            entry.pending_pairing = None;
        })
        .await
    }

    pub async fn remove(&self, device_id: &str) -> Option<DeviceEntry> {
        self.devices.write().await.remove(device_id)
    }

    pub async fn remove_if_generation(&self, device_id: &str, generation: u64) -> Option<DeviceEntry> {
        let mut devices = self.devices.write().await;
        if devices.get(device_id)?.generation != generation {
            return None;
        }
        devices.remove(device_id)
    }

    pub async fn list_all(&self) -> Vec<DeviceEntry> {
        let mut entries: Vec<DeviceEntry> = self.devices.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        entries
    }

    pub async fn status_snapshot(&self, history: &ChatHistoryStore) -> StatusReport {
        let devices = self.list_all().await.iter().map(DeviceEntry::status).collect();
        StatusReport {
            devices,
            chat_history: history.stats().await,
        }
    }

    /// Send through a device, failing fast when it is not connected
    pub async fn send_text(&self, device_id: &str, chat_id: &str, text: &str) -> Result<(), DeviceError> {
        let handle = {
            let devices = self.devices.read().await;
            let entry = devices
                .get(device_id)
                .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))?;
            match (&entry.handle, entry.connected) {
                (Some(handle), true) => handle.clone(),
                _ => return Err(DeviceError::NotConnected(device_id.to_string())),
            }
        };

        handle.send_text(chat_id, text).await?;
        Ok(())
    }
}
