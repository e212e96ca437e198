//! AutoDJ: paced playback of the studio playlist.
//!
//! The play loop streams the current track's raw bytes into the studio's
//! producer callback at roughly the target bitrate. A small bounded control
//! queue carries skip/reload/stop; publishers never block on it.

use super::playlist::{PlaylistSource, Track};
use crate::analytics::{AnalyticsClient, PlayEvent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CHUNK_SIZE: usize = 4096;
const CONTROL_QUEUE_DEPTH: usize = 8;
const EMPTY_PLAYLIST_RETRY: Duration = Duration::from_secs(3);
const MAX_PACING_SLEEP: Duration = Duration::from_millis(700);
const FALLBACK_BYTES_PER_SEC: u64 = 16_000;

/// Callback that hands a finished chunk to the studio pipeline.
pub type PushFn = Arc<dyn Fn(Bytes) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DjCommand {
    Skip,
    ForceReload,
    Stop,
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("open: {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("read: {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("skipped: {path}")]
    Skipped { path: PathBuf },
}

#[derive(Debug)]
enum StreamEnd {
    Completed,
    Cancelled,
}

#[derive(Default)]
struct NowState {
    current: Option<Track>,
    next: Option<Track>,
    started_at: Option<DateTime<Utc>>,
    // Guard so a skip only lands on the file it was aimed at.
    active_file: Option<PathBuf>,
}

/// Read-only now-playing snapshot.
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub current: Track,
    pub next: Option<Track>,
    pub started_at: DateTime<Utc>,
}

/// Cheap clonable handle used by HTTP handlers.
#[derive(Clone)]
pub struct AutoDjHandle {
    ctrl_tx: mpsc::Sender<DjCommand>,
    now: Arc<Mutex<NowState>>,
}

impl AutoDjHandle {
    /// Asks the play loop to end the current file early. Returns false when
    /// the AutoDJ is no longer running; a full queue counts as delivered
    /// since queued skips collapse to one effect.
    pub fn skip(&self) -> bool {
        match self.ctrl_tx.try_send(DjCommand::Skip) {
            Ok(()) | Err(TrySendError::Full(_)) => !self.ctrl_tx.is_closed(),
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn force_reload(&self) {
        let _ = self.ctrl_tx.try_send(DjCommand::ForceReload);
    }

    pub fn stop(&self) {
        let _ = self.ctrl_tx.try_send(DjCommand::Stop);
    }

    pub fn is_active(&self) -> bool {
        !self.ctrl_tx.is_closed()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        let state = self.now.lock().unwrap();
        let current = state.current.clone()?;
        if current.file.is_empty() {
            return None;
        }
        Some(NowPlaying {
            current,
            next: state.next.clone(),
            started_at: state.started_at.unwrap_or_else(Utc::now),
        })
    }
}

pub struct AutoDj {
    playlist: PlaylistSource,
    bitrate_kbps: i64,
    push: PushFn,
    ctrl_rx: mpsc::Receiver<DjCommand>,
    now: Arc<Mutex<NowState>>,
    fallback_path: Option<PathBuf>,
    client: AnalyticsClient,
}

impl AutoDj {
    pub fn new(
        playlist: PlaylistSource,
        bitrate_kbps: i64,
        push: PushFn,
        fallback_path: Option<PathBuf>,
        client: AnalyticsClient,
    ) -> (Self, AutoDjHandle) {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let now = Arc::new(Mutex::new(NowState::default()));
        let handle = AutoDjHandle {
            ctrl_tx,
            now: now.clone(),
        };
        (
            Self {
                playlist,
                bitrate_kbps,
                push,
                ctrl_rx,
                now,
                fallback_path,
                client,
            },
            handle,
        )
    }

    /// Main loop; runs until cancelled or stopped.
    pub async fn play(mut self, cancel: CancellationToken) {
        let bytes_per_sec = bytes_per_sec(self.bitrate_kbps);

        loop {
            if cancel.is_cancelled() {
                return;
            }

            self.playlist.ensure().await;
            let current = match self.playlist.current().or_else(|| self.playlist.advance()) {
                Some(track) => track,
                None => {
                    if self.try_fallback(bytes_per_sec, &cancel).await {
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(EMPTY_PLAYLIST_RETRY) => {}
                    }
                    continue;
                }
            };
            let next = self.playlist.next_track();

            {
                let mut state = self.now.lock().unwrap();
                state.current = Some(current.clone());
                state.next = next;
                state.started_at = Some(Utc::now());
                state.active_file = Some(current.path.clone());
            }
            self.client
                .send_play_events_detached(vec![PlayEvent::track_started(
                    &current.id,
                    &current.file,
                )]);

            info!("autodj: playing {}", display_name(&current));
            match self.stream_file(&current.path, bytes_per_sec, &cancel).await {
                Ok(StreamEnd::Completed) => {
                    self.client
                        .send_play_events_detached(vec![PlayEvent::track_ended(
                            &current.id,
                            &current.file,
                        )]);
                }
                Ok(StreamEnd::Cancelled) => return,
                Err(err) => {
                    // Skipped tracks land here as well; no track_ended either way.
                    warn!("autodj: track ended early ({}): {}", display_name(&current), err);
                }
            }
            self.now.lock().unwrap().active_file = None;

            self.playlist.ensure().await;
            self.playlist.advance();
        }
    }

    /// Streams the fallback file once, when configured and present.
    async fn try_fallback(&mut self, bytes_per_sec: u64, cancel: &CancellationToken) -> bool {
        let path = match &self.fallback_path {
            Some(path) => path.clone(),
            None => return false,
        };
        if !path.exists() {
            return false;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let track = Track {
            title: name.clone(),
            file: name,
            path: path.clone(),
            ..Track::default()
        };

        {
            let mut state = self.now.lock().unwrap();
            state.current = Some(track.clone());
            state.next = None;
            state.started_at = Some(Utc::now());
            state.active_file = Some(path.clone());
        }
        self.client
            .send_play_events_detached(vec![PlayEvent::track_started(&track.id, &track.file)]);

        match self.stream_file(&path, bytes_per_sec, cancel).await {
            Ok(StreamEnd::Completed) => {
                self.client
                    .send_play_events_detached(vec![PlayEvent::track_ended(&track.id, &track.file)]);
            }
            Ok(StreamEnd::Cancelled) => {}
            Err(err) => warn!("autodj: error streaming fallback {:?}: {}", path, err),
        }
        self.now.lock().unwrap().active_file = None;
        true
    }

    async fn stream_file(
        &mut self,
        path: &Path,
        bytes_per_sec: u64,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, TrackError> {
        let mut file = tokio::fs::File::open(path).await.map_err(|source| {
            TrackError::Open {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let start = Instant::now();
        let mut sent: u64 = 0;
        let mut buf = [0u8; CHUNK_SIZE];

        loop {
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            while let Ok(cmd) = self.ctrl_rx.try_recv() {
                match cmd {
                    DjCommand::Skip => {
                        let same = self
                            .now
                            .lock()
                            .unwrap()
                            .active_file
                            .as_deref()
                            .map(|active| active == path)
                            .unwrap_or(false);
                        if same {
                            return Err(TrackError::Skipped {
                                path: path.to_path_buf(),
                            });
                        }
                    }
                    DjCommand::ForceReload => self.playlist.force_reload(),
                    DjCommand::Stop => return Ok(StreamEnd::Cancelled),
                }
            }

            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(source) => {
                    return Err(TrackError::Read {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            };
            if n == 0 {
                return Ok(StreamEnd::Completed);
            }

            // Chunks handed downstream must be immutable; copy out of the
            // reusable read buffer.
            (self.push)(Bytes::copy_from_slice(&buf[..n]));
            sent += n as u64;

            if let Some(delay) = pacing_delay(sent, bytes_per_sec, start.elapsed()) {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn display_name(track: &Track) -> &str {
    if track.title.is_empty() {
        &track.file
    } else {
        &track.title
    }
}

fn bytes_per_sec(bitrate_kbps: i64) -> u64 {
    if bitrate_kbps <= 0 {
        FALLBACK_BYTES_PER_SEC
    } else {
        bitrate_kbps as u64 * 1000 / 8
    }
}

/// How long to sleep so `sent` bytes took `sent / bytes_per_sec` seconds of
/// wall clock, capped to keep a mis-declared bitrate from stalling playback.
fn pacing_delay(sent: u64, bytes_per_sec: u64, elapsed: Duration) -> Option<Duration> {
    let expected = Duration::from_secs_f64(sent as f64 / bytes_per_sec as f64);
    if expected <= elapsed {
        return None;
    }
    Some((expected - elapsed).min(MAX_PACING_SLEEP))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn collecting_push() -> (PushFn, Arc<Mutex<Vec<u8>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let push: PushFn = Arc::new(move |chunk: Bytes| {
            sink.lock().unwrap().extend_from_slice(&chunk);
        });
        (push, collected)
    }

    fn autodj_for_dir(dir: PathBuf, push: PushFn) -> (AutoDj, AutoDjHandle) {
        AutoDj::new(
            PlaylistSource::folder(dir),
            // High bitrate keeps pacing sleeps negligible in tests.
            100_000,
            push,
            None,
            AnalyticsClient::disabled(),
        )
    }

    #[test]
    fn bitrate_conversion_defaults_when_unset() {
        assert_eq!(bytes_per_sec(128), 16_000);
        assert_eq!(bytes_per_sec(64), 8_000);
        assert_eq!(bytes_per_sec(0), 16_000);
        assert_eq!(bytes_per_sec(-5), 16_000);
    }

    #[test]
    fn pacing_sleep_is_capped() {
        // 1 MB at 16 KB/s would be over a minute ahead of schedule.
        let delay = pacing_delay(1_000_000, 16_000, Duration::ZERO).unwrap();
        assert_eq!(delay, MAX_PACING_SLEEP);

        // Behind schedule: no sleep at all.
        assert!(pacing_delay(100, 16_000, Duration::from_secs(1)).is_none());

        // Slightly ahead: sleep the difference.
        let delay = pacing_delay(16_000, 16_000, Duration::from_millis(900)).unwrap();
        assert!(delay <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn stream_file_pushes_whole_file_in_order() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("a.mp3");
        fs::write(&path, &content).unwrap();

        let (push, collected) = collecting_push();
        let (mut dj, _handle) = autodj_for_dir(dir.path().to_path_buf(), push);

        let end = dj
            .stream_file(&path, 10_000_000, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(end, StreamEnd::Completed));
        assert_eq!(*collected.lock().unwrap(), content);
    }

    #[tokio::test]
    async fn stream_file_open_error_is_a_track_error() {
        let dir = TempDir::new().unwrap();
        let (push, _) = collecting_push();
        let (mut dj, _handle) = autodj_for_dir(dir.path().to_path_buf(), push);

        let err = dj
            .stream_file(
                &dir.path().join("missing.mp3"),
                10_000_000,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::Open { .. }));
    }

    #[tokio::test]
    async fn skip_only_lands_on_the_active_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, vec![0u8; 8192]).unwrap();

        let (push, _) = collecting_push();
        let (mut dj, handle) = autodj_for_dir(dir.path().to_path_buf(), push);

        // Skip aimed at a different file is ignored.
        dj.now.lock().unwrap().active_file = Some(dir.path().join("b.mp3"));
        assert!(handle.skip());
        let end = dj
            .stream_file(&path, 10_000_000, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(end, StreamEnd::Completed));

        // Skip aimed at the streaming file ends it early.
        dj.now.lock().unwrap().active_file = Some(path.clone());
        assert!(handle.skip());
        let err = dj
            .stream_file(&path, 10_000_000, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::Skipped { .. }));
    }

    #[tokio::test]
    async fn stop_command_ends_streaming() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, vec![0u8; 8192]).unwrap();

        let (push, _) = collecting_push();
        let (mut dj, handle) = autodj_for_dir(dir.path().to_path_buf(), push);
        handle.stop();

        let end = dj
            .stream_file(&path, 10_000_000, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(end, StreamEnd::Cancelled));
    }

    #[tokio::test]
    async fn control_publish_never_blocks() {
        let dir = TempDir::new().unwrap();
        let (push, _) = collecting_push();
        let (_dj, handle) = autodj_for_dir(dir.path().to_path_buf(), push);

        // Way past the queue depth; extra commands are dropped.
        for _ in 0..50 {
            assert!(handle.skip());
        }
    }

    #[tokio::test]
    async fn handle_reports_inactive_after_play_ends() {
        let dir = TempDir::new().unwrap();
        let (push, _) = collecting_push();
        let (dj, handle) = autodj_for_dir(dir.path().to_path_buf(), push);

        let cancel = CancellationToken::new();
        cancel.cancel();
        dj.play(cancel).await;

        assert!(!handle.is_active());
        assert!(!handle.skip());
    }

    #[tokio::test]
    async fn now_playing_empty_until_track_starts() {
        let dir = TempDir::new().unwrap();
        let (push, _) = collecting_push();
        let (_dj, handle) = autodj_for_dir(dir.path().to_path_buf(), push);
        assert!(handle.now_playing().is_none());
    }
}
