//! Studio registry: creation, lookup and coordinated shutdown.

use super::studio::{Studio, StudioSettings};
use crate::geo::GeoResolver;
use crate::listeners::ListenerStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct StudioManager {
    studios: RwLock<HashMap<String, Arc<Studio>>>,
    audio_base_dir: PathBuf,
    settings: StudioSettings,
    store: Arc<ListenerStore>,
    geo: Arc<GeoResolver>,
}

impl StudioManager {
    pub fn new(
        audio_base_dir: PathBuf,
        settings: StudioSettings,
        store: Arc<ListenerStore>,
        geo: Arc<GeoResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            studios: RwLock::new(HashMap::new()),
            audio_base_dir,
            settings,
            store,
            geo,
        })
    }

    /// Creates the studio on first use; registering an existing id returns
    /// the running instance.
    pub fn register_studio(&self, id: &str) -> Arc<Studio> {
        if let Some(studio) = self.studios.read().unwrap().get(id) {
            return studio.clone();
        }
        let mut studios = self.studios.write().unwrap();
        studios
            .entry(id.to_string())
            .or_insert_with(|| {
                let dir = self.audio_base_dir.join(id);
                info!("manager: registered studio {} (audio_dir={:?})", id, dir);
                Studio::new(id.to_string(), dir, &self.settings, self.store.clone())
            })
            .clone()
    }

    pub fn get_studio(&self, id: &str) -> Option<Arc<Studio>> {
        self.studios.read().unwrap().get(id).cloned()
    }

    pub fn list_studios(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.studios.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn settings(&self) -> &StudioSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ListenerStore> {
        &self.store
    }

    pub fn geo(&self) -> &Arc<GeoResolver> {
        &self.geo
    }

    /// Cancels every studio concurrently and waits for their tasks.
    pub async fn shutdown(&self) {
        let studios: Vec<Arc<Studio>> = self.studios.read().unwrap().values().cloned().collect();
        info!("manager: shutting down ({} studios)", studios.len());
        futures::future::join_all(studios.iter().map(|studio| studio.shutdown())).await;
    }

    /// Periodic log of the registered studio ids, for ops visibility.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                info!("manager monitor: studios={:?}", manager.list_studios());
            }
        })
    }
}
