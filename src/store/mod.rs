mod error;

pub use error::StoreError;

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use ulid::Ulid;

use crate::config::limits::*;
use crate::model::*;
use crate::wal::Wal;

/// Where pending reservation requests live between daily runs.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_pending(&self) -> Result<Vec<ReservationRequest>, StoreError>;

    /// `Ok(false)` when a live request with the same (slot, court, account) exists;
    /// the store is left unchanged.
    async fn add(&self, request: ReservationRequest) -> Result<bool, StoreError>;

    /// `Ok(false)` when the request was already gone.
    async fn remove(&self, request: &ReservationRequest) -> Result<bool, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Owns the WAL. Appends that arrive while one is being handled join the
/// same batch and share a single fsync; a compaction first commits the batch.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Pending = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    next = rx.try_recv().ok();
                }
                WalCommand::Compact { events, response } => {
                    commit(&mut wal, &mut batch);
                    let _ = response.send(wal.compact(&events));
                }
            }
        }
        commit(&mut wal, &mut batch);
    }
}

fn commit(wal: &mut Wal<Event>, batch: &mut Pending) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no partial bytes leak into the next batch.
    let flushed = wal.flush_sync();
    let result = appended.and(flushed);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let _ = tx.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

/// In-memory index of live requests, optionally made durable by a WAL.
pub struct RequestStore {
    requests: DashMap<Ulid, ReservationRequest>,
    keys: DashMap<RequestKey, Ulid>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    appends_since_compact: AtomicU64,
    compact_threshold: u64,
    /// Held across check-then-write so uniqueness holds under concurrent adds.
    mutations: Mutex<()>,
}

impl RequestStore {
    /// Volatile store, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            requests: DashMap::new(),
            keys: DashMap::new(),
            wal_tx: None,
            appends_since_compact: AtomicU64::new(0),
            compact_threshold: u64::MAX,
            mutations: Mutex::new(()),
        }
    }

    /// Replay the WAL at `path` and spawn its writer. Must run inside a tokio runtime.
    pub fn open(path: &Path, compact_threshold: u64) -> Result<Self, StoreError> {
        let events: Vec<Event> =
            Wal::replay(path).map_err(|e| StoreError::WalError(e.to_string()))?;
        let wal = Wal::open(path).map_err(|e| StoreError::WalError(e.to_string()))?;
        let (wal_tx, wal_rx) = mpsc::channel(1024);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            wal_tx: Some(wal_tx),
            appends_since_compact: AtomicU64::new(events.len() as u64),
            compact_threshold,
            ..Self::in_memory()
        };
        for event in events {
            store.apply(event);
        }
        metrics::gauge!(crate::observability::PENDING_REQUESTS).set(store.len() as f64);
        Ok(store)
    }

    fn apply(&self, event: Event) {
        match event {
            Event::RequestAdded { request } => {
                self.keys.insert(request.key(), request.id);
                self.requests.insert(request.id, request);
            }
            Event::RequestRemoved { id } => {
                if let Some((_, request)) = self.requests.remove(&id) {
                    self.keys.remove(&request.key());
                }
            }
        }
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        self.appends_since_compact.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Persist + apply. Caller holds `mutations`.
    async fn commit_event(&self, event: Event) -> Result<(), StoreError> {
        self.wal_append(&event).await?;
        self.apply(event);
        metrics::gauge!(crate::observability::PENDING_REQUESTS).set(self.len() as f64);
        Ok(())
    }

    /// Rewrite the WAL with one `RequestAdded` per live request.
    async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let events: Vec<Event> = self
            .snapshot()
            .into_iter()
            .map(|request| Event::RequestAdded { request })
            .collect();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        self.appends_since_compact.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<ReservationRequest> {
        self.requests.get(id).map(|e| e.value().clone())
    }

    /// Live requests ordered by slot, then creation.
    pub fn snapshot(&self) -> Vec<ReservationRequest> {
        let mut all: Vec<ReservationRequest> =
            self.requests.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| {
            a.target
                .cmp(&b.target)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        all
    }

    pub fn for_account(&self, account: &AccountId) -> Vec<ReservationRequest> {
        self.snapshot()
            .into_iter()
            .filter(|r| &r.account == account)
            .collect()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Store for RequestStore {
    async fn list_pending(&self) -> Result<Vec<ReservationRequest>, StoreError> {
        Ok(self.snapshot())
    }

    async fn add(&self, request: ReservationRequest) -> Result<bool, StoreError> {
        if request.account.as_str().len() > MAX_ACCOUNT_NAME_LEN {
            return Err(StoreError::LimitExceeded("account name too long"));
        }
        let _guard = self.mutations.lock().await;
        if self.keys.contains_key(&request.key()) {
            return Ok(false);
        }
        let owned = self
            .requests
            .iter()
            .filter(|e| e.value().account == request.account)
            .count();
        if owned >= MAX_REQUESTS_PER_ACCOUNT {
            return Err(StoreError::LimitExceeded("too many requests for account"));
        }
        self.commit_event(Event::RequestAdded { request }).await?;
        Ok(true)
    }

    async fn remove(&self, request: &ReservationRequest) -> Result<bool, StoreError> {
        let _guard = self.mutations.lock().await;
        if !self.requests.contains_key(&request.id) {
            return Ok(false);
        }
        self.commit_event(Event::RequestRemoved { id: request.id }).await?;
        if self.appends_since_compact() >= self.compact_threshold {
            if let Err(e) = self.compact().await {
                tracing::warn!("request WAL compaction failed: {e}");
            }
        }
        Ok(true)
    }
}
