//! Playlist sources for the AutoDJ.
//!
//! Two variants share one capability set: a folder scan over the studio's
//! audio directory, and a backend-provided track list fetched over HTTP.
//! Both keep a cursor into an ordered snapshot; `advance` wraps around.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

const BACKEND_TTL: Duration = Duration::from_secs(5);
const BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Track {
    pub id: String,
    pub file: String,
    pub path: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_sec: f64,
}

/// Tagged playlist variant; the AutoDJ only sees this surface.
pub enum PlaylistSource {
    Folder(FolderPlaylist),
    Backend(BackendPlaylist),
}

impl PlaylistSource {
    pub fn folder(dir: PathBuf) -> Self {
        Self::Folder(FolderPlaylist::new(dir))
    }

    pub fn backend(dir: PathBuf, endpoint: String, api_key: Option<String>) -> Self {
        Self::Backend(BackendPlaylist::new(dir, endpoint, api_key))
    }

    /// Refreshes the snapshot when stale. Failures keep the previous one.
    pub async fn ensure(&self) {
        match self {
            Self::Folder(p) => p.ensure(),
            Self::Backend(p) => p.ensure().await,
        }
    }

    pub fn current(&self) -> Option<Track> {
        match self {
            Self::Folder(p) => p.cursor.current(),
            Self::Backend(p) => p.cursor.current(),
        }
    }

    pub fn next_track(&self) -> Option<Track> {
        match self {
            Self::Folder(p) => p.cursor.next_track(),
            Self::Backend(p) => p.cursor.next_track(),
        }
    }

    pub fn advance(&self) -> Option<Track> {
        match self {
            Self::Folder(p) => p.cursor.advance(),
            Self::Backend(p) => p.cursor.advance(),
        }
    }

    pub fn force_reload(&self) {
        match self {
            Self::Folder(p) => p.force_reload(),
            Self::Backend(p) => p.force_reload(),
        }
    }
}

struct CursorState {
    tracks: Vec<Track>,
    // -1 means unstarted (or empty snapshot).
    idx: isize,
}

/// Snapshot + cursor shared by both variants. Reads take the read lock,
/// `advance` and snapshot replacement the write lock.
struct Cursor {
    state: RwLock<CursorState>,
}

impl Cursor {
    fn new() -> Self {
        Self {
            state: RwLock::new(CursorState {
                tracks: Vec::new(),
                idx: -1,
            }),
        }
    }

    fn is_empty(&self) -> bool {
        self.state.read().unwrap().tracks.is_empty()
    }

    /// Replaces the snapshot. The cursor is preserved while still in range,
    /// clamped to 0 when it ran past the end, and -1 on an empty snapshot.
    fn replace(&self, tracks: Vec<Track>) {
        let mut state = self.state.write().unwrap();
        let count = tracks.len() as isize;
        state.tracks = tracks;
        if count == 0 {
            state.idx = -1;
        } else if state.idx >= count {
            state.idx = 0;
        }
    }

    fn current(&self) -> Option<Track> {
        let state = self.state.read().unwrap();
        if state.idx < 0 || state.idx >= state.tracks.len() as isize {
            return None;
        }
        Some(state.tracks[state.idx as usize].clone())
    }

    fn next_track(&self) -> Option<Track> {
        let state = self.state.read().unwrap();
        if state.tracks.is_empty() {
            return None;
        }
        if state.idx < 0 {
            // Not started yet; "next" is the first.
            return Some(state.tracks[0].clone());
        }
        let n = (state.idx as usize + 1) % state.tracks.len();
        Some(state.tracks[n].clone())
    }

    fn advance(&self) -> Option<Track> {
        let mut state = self.state.write().unwrap();
        if state.tracks.is_empty() {
            state.idx = -1;
            return None;
        }
        state.idx = if state.idx < 0 {
            0
        } else {
            (state.idx + 1) % state.tracks.len() as isize
        };
        Some(state.tracks[state.idx as usize].clone())
    }
}

/// Directory-backed playlist; rescans when the directory mtime advances.
pub struct FolderPlaylist {
    dir: PathBuf,
    cursor: Cursor,
    last_mod: RwLock<Option<SystemTime>>,
}

impl FolderPlaylist {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cursor: Cursor::new(),
            last_mod: RwLock::new(None),
        }
    }

    fn ensure(&self) {
        let modified = match std::fs::metadata(&self.dir).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return,
        };
        let stale = {
            let last_mod = self.last_mod.read().unwrap();
            self.cursor.is_empty() || last_mod.map(|m| modified > m).unwrap_or(true)
        };
        if stale {
            self.reload(modified);
        }
    }

    fn reload(&self, modified: SystemTime) {
        let tracks = match scan_mp3_files(&self.dir) {
            Ok(tracks) => tracks,
            Err(_) => return,
        };
        debug!("playlist: scanned {} tracks from {:?}", tracks.len(), self.dir);
        self.cursor.replace(tracks);
        *self.last_mod.write().unwrap() = Some(modified);
    }

    fn force_reload(&self) {
        if let Ok(modified) = std::fs::metadata(&self.dir).and_then(|m| m.modified()) {
            self.reload(modified);
        }
    }
}

/// Scans `dir` for regular `.mp3` files (case-insensitive), sorted by name.
/// Lexicographic ordering keeps enumeration deterministic across reloads.
pub fn scan_mp3_files(dir: &Path) -> Result<Vec<Track>> {
    let mut tracks = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.to_lowercase().ends_with(".mp3") {
            tracks.push(Track {
                file: name.clone(),
                path: dir.join(&name),
                ..Track::default()
            });
        }
    }
    tracks.sort_by(|a, b| a.file.cmp(&b.file));
    Ok(tracks)
}

#[derive(Debug, Deserialize)]
struct BackendTrack {
    id: String,
    file: String,
    title: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    album: String,
    #[serde(default)]
    duration_seconds: f64,
}

/// Backend-provided playlist, refetched at most once per TTL.
pub struct BackendPlaylist {
    dir: PathBuf,
    endpoint: String,
    api_key: Option<String>,
    cursor: Cursor,
    last_fetch: RwLock<Option<Instant>>,
    http: reqwest::Client,
}

impl BackendPlaylist {
    fn new(dir: PathBuf, endpoint: String, api_key: Option<String>) -> Self {
        Self {
            dir,
            endpoint,
            api_key: api_key.filter(|k| !k.is_empty()),
            cursor: Cursor::new(),
            last_fetch: RwLock::new(None),
            http: reqwest::Client::builder()
                .timeout(BACKEND_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn ensure(&self) {
        let stale = {
            let last_fetch = self.last_fetch.read().unwrap();
            self.cursor.is_empty()
                || last_fetch.map(|t| t.elapsed() > BACKEND_TTL).unwrap_or(true)
        };
        if stale {
            self.fetch().await;
        }
    }

    async fn fetch(&self) {
        let mut request = self.http.get(&self.endpoint);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("playlist: backend returned status {}", response.status());
                return;
            }
            Err(err) => {
                debug!("playlist: backend fetch failed: {}", err);
                return;
            }
        };
        let body = match response.json::<Vec<BackendTrack>>().await {
            Ok(body) => body,
            Err(err) => {
                debug!("playlist: backend payload malformed: {}", err);
                return;
            }
        };

        self.cursor.replace(map_backend_tracks(&self.dir, body));
        *self.last_fetch.write().unwrap() = Some(Instant::now());
    }

    fn force_reload(&self) {
        *self.last_fetch.write().unwrap() = None;
    }
}

fn map_backend_tracks(dir: &Path, tracks: Vec<BackendTrack>) -> Vec<Track> {
    tracks
        .into_iter()
        .map(|t| Track {
            path: dir.join(&t.file),
            id: t.id,
            file: t.file,
            title: t.title,
            artist: t.artist,
            album: t.album,
            duration_sec: t.duration_seconds,
        })
        .collect()
}
