//! Shared test harness: scripted downloader port, in-memory metadata, and
//! a fully wired engine over in-memory SQLite.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use soulspot_core::library::LogOnlyImporter;
use soulspot_core::track::{self, TrackInfo, TrackReader};
use soulspot_core::workers::WorkerHeartbeats;
use soulspot_core::{
    Blocklist, CircuitBreaker, Database, DispatcherWorker, DownloadStore, EngineContext,
    EnqueueWorker, EventBus, GuardedDownloader, Hit, InMemorySettings, Orchestrator, PortError,
    RetryScheduler, SearchAndFetch, StatusSyncWorker, TransferState, TransferUpdate,
};

/// Cloneable stand-in for [`PortError`] so scripts can repeat.
#[derive(Debug, Clone)]
pub enum ScriptedError {
    Unavailable,
    Timeout,
    RateLimited,
    NotFound,
    Rejected(String),
}

impl ScriptedError {
    fn to_port_error(&self) -> PortError {
        match self {
            Self::Unavailable => PortError::Unavailable {
                reason: "scripted outage".to_string(),
            },
            Self::Timeout => PortError::Timeout {
                operation: "scripted",
                seconds: 5,
            },
            Self::RateLimited => PortError::RateLimited,
            Self::NotFound => PortError::NotFound,
            Self::Rejected(reason) => PortError::Rejected {
                reason: reason.clone(),
            },
        }
    }
}

type Scripted<T> = Result<T, ScriptedError>;

/// Scripted downloader port with call counters for spying.
///
/// `search` and `status` scripts repeat their last entry once exhausted;
/// `enqueue` entries are consumed one per call and panic when the script
/// runs dry (an unscripted enqueue is a test bug).
#[derive(Default)]
pub struct StubDownloader {
    search_script: Mutex<VecDeque<Scripted<Vec<Hit>>>>,
    enqueue_script: Mutex<VecDeque<Scripted<String>>>,
    status_scripts: Mutex<HashMap<String, VecDeque<Scripted<TransferUpdate>>>>,
    pub search_calls: AtomicUsize,
    pub enqueue_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub cancel_calls: Mutex<Vec<String>>,
}

impl StubDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_search(&self, result: Scripted<Vec<Hit>>) {
        self.search_script.lock().unwrap().push_back(result);
    }

    pub fn script_enqueue(&self, result: Scripted<String>) {
        self.enqueue_script.lock().unwrap().push_back(result);
    }

    pub fn script_status(&self, external_ref: &str, result: Scripted<TransferUpdate>) {
        self.status_scripts
            .lock()
            .unwrap()
            .entry(external_ref.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn clear_status(&self, external_ref: &str) {
        self.status_scripts.lock().unwrap().remove(external_ref);
    }

    fn next_repeating<T: Clone>(queue: &mut VecDeque<Scripted<T>>) -> Option<Scripted<T>> {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl SearchAndFetch for StubDownloader {
    async fn search(&self, _query: &str) -> Result<Vec<Hit>, PortError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.search_script.lock().unwrap();
        match Self::next_repeating(&mut script) {
            Some(Ok(hits)) => Ok(hits),
            Some(Err(err)) => Err(err.to_port_error()),
            None => Ok(Vec::new()),
        }
    }

    async fn enqueue(
        &self,
        peer: &str,
        filename: &str,
        _size_bytes: i64,
        _priority: i64,
    ) -> Result<String, PortError> {
        self.enqueue_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.enqueue_script.lock().unwrap().pop_front();
        match next {
            Some(Ok(external_ref)) => Ok(external_ref),
            Some(Err(err)) => Err(err.to_port_error()),
            None => panic!("unscripted enqueue for {peer}/{filename}"),
        }
    }

    async fn status(&self, external_ref: &str) -> Result<TransferUpdate, PortError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.status_scripts.lock().unwrap();
        match scripts
            .get_mut(external_ref)
            .and_then(Self::next_repeating)
        {
            Some(Ok(update)) => Ok(update),
            Some(Err(err)) => Err(err.to_port_error()),
            None => Err(PortError::NotFound),
        }
    }

    async fn cancel(&self, external_ref: &str) -> Result<(), PortError> {
        self.cancel_calls
            .lock()
            .unwrap()
            .push(external_ref.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<(), PortError> {
        Ok(())
    }
}

/// In-memory track metadata.
#[derive(Default)]
pub struct StubTracks {
    tracks: Mutex<HashMap<String, TrackInfo>>,
    albums: Mutex<HashMap<String, Vec<String>>>,
}

impl StubTracks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&self, id: &str, artist: &str, title: &str) {
        self.tracks.lock().unwrap().insert(
            id.to_string(),
            TrackInfo {
                title: title.to_string(),
                artist: artist.to_string(),
                album: None,
            },
        );
    }

    pub fn add_album(&self, album_id: &str, track_ids: &[&str]) {
        self.albums.lock().unwrap().insert(
            album_id.to_string(),
            track_ids.iter().map(|s| (*s).to_string()).collect(),
        );
    }
}

#[async_trait]
impl TrackReader for StubTracks {
    async fn track(&self, track_id: &str) -> track::Result<Option<TrackInfo>> {
        Ok(self.tracks.lock().unwrap().get(track_id).cloned())
    }

    async fn album_track_ids(&self, album_id: &str, _source: &str) -> track::Result<Vec<String>> {
        Ok(self
            .albums
            .lock()
            .unwrap()
            .get(album_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Fully wired engine over in-memory SQLite with scripted collaborators.
pub struct TestEngine {
    pub ctx: EngineContext,
    pub orchestrator: Orchestrator,
    pub dispatcher: DispatcherWorker,
    pub enqueuer: EnqueueWorker,
    pub status_sync: StatusSyncWorker,
    pub retry: RetryScheduler,
    pub port: Arc<StubDownloader>,
    pub tracks: Arc<StubTracks>,
    pub settings: Arc<InMemorySettings>,
}

impl TestEngine {
    pub async fn new() -> Self {
        let db = Database::new_in_memory().await.unwrap();
        let port = Arc::new(StubDownloader::new());
        let tracks = Arc::new(StubTracks::new());
        let settings = Arc::new(InMemorySettings::new());
        let breaker = Arc::new(CircuitBreaker::default());
        let downloader = Arc::new(GuardedDownloader::new(
            Arc::clone(&port) as Arc<dyn SearchAndFetch>,
            Arc::clone(&breaker),
        ));

        let ctx = EngineContext {
            store: DownloadStore::new(db.clone()),
            blocklist: Blocklist::new(db),
            settings: Arc::clone(&settings) as Arc<dyn soulspot_core::SettingsReader>,
            tracks: Arc::clone(&tracks) as Arc<dyn TrackReader>,
            downloader,
            importer: Arc::new(LogOnlyImporter),
            breaker,
            events: EventBus::default(),
            heartbeats: Arc::new(WorkerHeartbeats::new()),
        };

        Self {
            orchestrator: Orchestrator::new(ctx.clone()),
            dispatcher: DispatcherWorker::new(ctx.clone()),
            enqueuer: EnqueueWorker::new(ctx.clone()),
            status_sync: StatusSyncWorker::new(ctx.clone()),
            retry: RetryScheduler::new(ctx.clone()),
            port,
            tracks,
            settings,
            ctx,
        }
    }

    pub async fn config(&self) -> soulspot_core::EngineConfig {
        let config =
            soulspot_core::EngineConfig::load(self.ctx.settings.as_ref()).await;
        self.ctx.breaker.set_config(config.breaker);
        config
    }
}

/// A lossless hit from the given peer.
pub fn flac_hit(peer: &str, filename: &str, bitrate: i64) -> Hit {
    Hit {
        peer: peer.to_string(),
        filename: filename.to_string(),
        size_bytes: 30_000_000,
        bitrate_kbps: Some(bitrate),
        format: None,
    }
}

/// A transfer snapshot in the given state.
pub fn update(state: TransferState, bytes_done: i64, bytes_total: i64) -> TransferUpdate {
    TransferUpdate {
        state,
        bytes_done,
        bytes_total: Some(bytes_total),
        local_path: None,
        error: None,
    }
}
