//! A studio: one broadcast channel, one feed, many listeners.
//!
//! All upstream audio (live ingest or AutoDJ) funnels through the bounded
//! feed queue; a single distributor task fans chunks out to per-listener
//! channels with non-blocking sends and slow-consumer eviction.

use super::analytics::spawn_analytics;
use super::autodj::{AutoDj, AutoDjHandle, PushFn};
use super::live::LiveMeta;
use super::playlist::PlaylistSource;
use crate::analytics::AnalyticsClient;
use crate::listeners::{Listener, ListenerStore};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const FEED_CAPACITY: usize = 4096;
pub const LISTENER_CHANNEL_CAPACITY: usize = 2048;
const MAX_CONSECUTIVE_DROPS: u32 = 50;
const HEARTBEAT_STALE_MS: i64 = 5_000;
const DROP_LOG_EVERY: u64 = 500;

/// Per-studio knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct StudioSettings {
    pub bitrate_kbps: i64,
    pub source_user: String,
    pub source_password: Option<String>,
    pub backend_api: Option<String>,
    pub backend_api_key: Option<String>,
    pub flush_interval: Duration,
    pub fallback_file: Option<PathBuf>,
}

struct ListenerSlot {
    tx: mpsc::Sender<Bytes>,
    dropped_in_a_row: AtomicU32,
    listener: Arc<Listener>,
}

/// State shared between the HTTP handlers, the distributor and the AutoDJ
/// producer callback.
pub(crate) struct StudioShared {
    pub(crate) id: String,
    live_active: AtomicBool,
    live_meta: Mutex<Option<LiveMeta>>,
    feed_tx: mpsc::Sender<Bytes>,
    listeners: RwLock<HashMap<Uuid, Arc<ListenerSlot>>>,
    listener_drops: AtomicU64,
    feed_drops: AtomicU64,
}

impl StudioShared {
    /// Non-blocking feed publish; a full queue drops the chunk.
    pub(crate) fn push_to_feed(&self, chunk: Bytes) {
        if self.feed_tx.try_send(chunk).is_err() {
            let dropped = self.feed_drops.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % DROP_LOG_EVERY == 0 {
                warn!("studio {}: feed full, dropped {} chunks so far", self.id, dropped);
            }
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live_active.load(Ordering::Acquire)
    }

    /// Claims the live slot. Fails when another source is already connected.
    pub(crate) fn try_begin_live(&self) -> bool {
        self.live_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_live(&self) {
        self.live_active.store(false, Ordering::Release);
        *self.live_meta.lock().unwrap() = None;
    }

    pub(crate) fn set_live_meta(&self, meta: LiveMeta) {
        *self.live_meta.lock().unwrap() = Some(meta);
    }

    pub(crate) fn live_meta(&self) -> Option<LiveMeta> {
        self.live_meta.lock().unwrap().clone()
    }

    fn subscribe(&self, listener: Arc<Listener>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        let slot = Arc::new(ListenerSlot {
            tx,
            dropped_in_a_row: AtomicU32::new(0),
            listener: listener.clone(),
        });
        let total = {
            let mut slots = self.listeners.write().unwrap();
            slots.insert(listener.id, slot);
            slots.len()
        };
        info!("studio {}: new listener {} (total={})", self.id, listener.id, total);
        rx
    }

    fn unsubscribe(&self, id: Uuid) {
        self.listeners.write().unwrap().remove(&id);
    }

    fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudioStatus {
    pub studio: String,
    pub is_live: bool,
    pub listeners_count: usize,
}

struct StudioTasks {
    core: Vec<JoinHandle<()>>,
    distributor: Option<JoinHandle<()>>,
}

pub struct Studio {
    pub id: String,
    pub audio_dir: PathBuf,
    shared: Arc<StudioShared>,
    autodj: AutoDjHandle,
    cancel: CancellationToken,
    distributor_cancel: CancellationToken,
    tasks: Mutex<StudioTasks>,
}

impl Studio {
    /// Creates the studio and starts its long-lived tasks: distributor,
    /// AutoDJ, and (when a backend is configured) the analytics flusher.
    pub fn new(
        id: String,
        audio_dir: PathBuf,
        settings: &StudioSettings,
        store: Arc<ListenerStore>,
    ) -> Arc<Self> {
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);
        let shared = Arc::new(StudioShared {
            id: id.clone(),
            live_active: AtomicBool::new(false),
            live_meta: Mutex::new(None),
            feed_tx,
            listeners: RwLock::new(HashMap::new()),
            listener_drops: AtomicU64::new(0),
            feed_drops: AtomicU64::new(0),
        });

        let analytics_client = match &settings.backend_api {
            Some(base) => AnalyticsClient::new(
                Some(format!("{}/studios/{}/listener-events", base, id)),
                settings.backend_api_key.clone(),
            ),
            None => AnalyticsClient::disabled(),
        };
        let play_events_client = match &settings.backend_api {
            Some(base) => AnalyticsClient::new(
                Some(format!("{}/studios/{}/play-events", base, id)),
                settings.backend_api_key.clone(),
            ),
            None => AnalyticsClient::disabled(),
        };

        let playlist = match &settings.backend_api {
            Some(base) => PlaylistSource::backend(
                audio_dir.clone(),
                format!("{}/studios/{}/playlist", base, id),
                settings.backend_api_key.clone(),
            ),
            None => PlaylistSource::folder(audio_dir.clone()),
        };

        // The selector: AutoDJ output is dropped at this boundary whenever a
        // live source holds the feed.
        let push: PushFn = {
            let shared = shared.clone();
            Arc::new(move |chunk: Bytes| {
                if !shared.is_live() {
                    shared.push_to_feed(chunk);
                }
            })
        };

        let (autodj, autodj_handle) = AutoDj::new(
            playlist,
            settings.bitrate_kbps,
            push,
            settings.fallback_file.clone(),
            play_events_client,
        );

        let cancel = CancellationToken::new();
        let distributor_cancel = CancellationToken::new();

        let mut core = Vec::new();
        core.push(tokio::spawn(autodj.play(cancel.child_token())));
        if analytics_client.is_enabled() {
            core.push(spawn_analytics(
                shared.clone(),
                store.clone(),
                analytics_client,
                settings.flush_interval,
                cancel.child_token(),
            ));
        }
        let distributor = tokio::spawn(distribute(
            feed_rx,
            shared.clone(),
            store,
            distributor_cancel.child_token(),
        ));

        Arc::new(Self {
            id,
            audio_dir,
            shared,
            autodj: autodj_handle,
            cancel,
            distributor_cancel,
            tasks: Mutex::new(StudioTasks {
                core,
                distributor: Some(distributor),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<StudioShared> {
        &self.shared
    }

    pub fn autodj(&self) -> &AutoDjHandle {
        &self.autodj
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    /// Metadata of the currently connected live source, if any.
    pub fn live_meta(&self) -> Option<LiveMeta> {
        self.shared.live_meta()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listener_count()
    }

    pub fn status(&self) -> StudioStatus {
        StudioStatus {
            studio: self.id.clone(),
            is_live: self.is_live(),
            listeners_count: self.listener_count(),
        }
    }

    /// Publishes a chunk to the feed regardless of the selector; used by the
    /// live ingest path, which owns the feed while connected.
    pub fn push_to_feed(&self, chunk: Bytes) {
        self.shared.push_to_feed(chunk);
    }

    /// Registers a listener with the distributor and returns its chunk
    /// channel. The caller must `unsubscribe` on exit.
    pub fn subscribe(&self, listener: Arc<Listener>) -> mpsc::Receiver<Bytes> {
        self.shared.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.shared.unsubscribe(id);
    }

    /// Stops AutoDJ and analytics first, then shuts the distributor down;
    /// listener channels close and their handlers unwind on their own.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let (core, distributor) = {
            let mut tasks = self.tasks.lock().unwrap();
            (std::mem::take(&mut tasks.core), tasks.distributor.take())
        };
        for task in core {
            let _ = task.await;
        }
        self.distributor_cancel.cancel();
        if let Some(task) = distributor {
            let _ = task.await;
        }
        info!("studio {}: shut down", self.id);
    }
}

/// Single consumer of the feed queue; fans every chunk out to all listener
/// channels without ever blocking on a slow one.
async fn distribute(
    mut feed_rx: mpsc::Receiver<Bytes>,
    shared: Arc<StudioShared>,
    store: Arc<ListenerStore>,
    cancel: CancellationToken,
) {
    info!("studio {}: distributor started", shared.id);
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = feed_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let mut to_evict = Vec::new();
        {
            let slots = shared.listeners.read().unwrap();
            for (id, slot) in slots.iter() {
                match slot.tx.try_send(chunk.clone()) {
                    Ok(()) => {
                        slot.dropped_in_a_row.store(0, Ordering::Relaxed);
                        slot.listener.add_bytes_sent(chunk.len() as u64);
                        slot.listener.touch_heartbeat(HEARTBEAT_STALE_MS);
                    }
                    Err(TrySendError::Full(_)) => {
                        let dropped = slot.dropped_in_a_row.fetch_add(1, Ordering::Relaxed) + 1;
                        let total = shared.listener_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        if total % DROP_LOG_EVERY == 0 {
                            warn!(
                                "studio {}: dropped listener frames={} (consider larger listener buffers)",
                                shared.id, total
                            );
                        }
                        if dropped > MAX_CONSECUTIVE_DROPS {
                            to_evict.push(*id);
                        }
                    }
                    // Receiver already gone; clean the slot up.
                    Err(TrySendError::Closed(_)) => to_evict.push(*id),
                }
            }
        }

        // Read guard released above; removal takes the write side.
        if !to_evict.is_empty() {
            let mut slots = shared.listeners.write().unwrap();
            for id in to_evict {
                if slots.remove(&id).is_some() {
                    store.remove(id);
                    warn!("studio {}: dropped slow listener {}", shared.id, id);
                }
            }
        }
    }

    // Closing every slot lets the listener handlers unwind.
    shared.listeners.write().unwrap().clear();
    info!("studio {}: distributor stopped", shared.id);
}
