use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::model::{AccountId, Candidate};

/// What the provider said about one booking submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderReply {
    Confirmed { reference: Option<String> },
    Declined { message: String },
}

#[derive(Debug)]
pub enum ClientError {
    /// The account already holds the maximum booked duration for the window.
    DurationExceeded(String),
    Transport(String),
    Parse(String),
    /// The cached session was refused mid-attempt.
    Session(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::DurationExceeded(m) => write!(f, "duration exceeded: {m}"),
            ClientError::Transport(e) => write!(f, "transport error: {e}"),
            ClientError::Parse(e) => write!(f, "unexpected provider response: {e}"),
            ClientError::Session(e) => write!(f, "session rejected: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub account: AccountId,
    pub reason: String,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no session for {}: {}", self.account, self.reason)
    }
}

impl std::error::Error for SessionError {}

/// The provider, seen from the engine.
#[async_trait]
pub trait BookingClient: Send + Sync + 'static {
    /// Make sure `account` has a usable session; `force_refresh` skips any cache.
    async fn ensure_session(&self, account: &AccountId, force_refresh: bool) -> Result<(), SessionError>;

    /// One booking submission. A single short round trip; never retried by the engine.
    async fn attempt_book(
        &self,
        account: &AccountId,
        candidate: &Candidate,
    ) -> Result<ProviderReply, ClientError>;
}

struct Cached<S> {
    session: S,
    established_at: DateTime<Utc>,
    generation: u64,
}

struct AccountSlot<S> {
    current: RwLock<Option<Cached<S>>>,
    refresh: Mutex<()>,
}

/// Per-account sessions with a time-to-live.
///
/// Reads are concurrent; at most one task per account runs a login at a time.
/// A task that queued behind a login reuses its result instead of logging in again.
pub struct SessionCache<S> {
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    accounts: DashMap<AccountId, Arc<AccountSlot<S>>>,
}

impl<S: Clone + Send + Sync + 'static> SessionCache<S> {
    pub fn new(ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
            accounts: DashMap::new(),
        }
    }

    fn slot(&self, account: &AccountId) -> Arc<AccountSlot<S>> {
        self.accounts
            .entry(account.clone())
            .or_insert_with(|| {
                Arc::new(AccountSlot {
                    current: RwLock::new(None),
                    refresh: Mutex::new(()),
                })
            })
            .clone()
    }

    fn is_fresh(&self, cached: &Cached<S>) -> bool {
        self.clock.now() - cached.established_at < self.ttl
    }

    /// The cached session, if one exists and has not outlived the TTL.
    pub async fn current(&self, account: &AccountId) -> Option<S> {
        let slot = self.slot(account);
        let guard = slot.current.read().await;
        guard
            .as_ref()
            .filter(|c| self.is_fresh(c))
            .map(|c| c.session.clone())
    }

    /// Return a fresh session, running `login` only when needed.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        account: &AccountId,
        force_refresh: bool,
        login: F,
    ) -> Result<S, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, SessionError>>,
    {
        let slot = self.slot(account);
        let seen_generation = {
            let guard = slot.current.read().await;
            if let Some(cached) = guard.as_ref()
                && !force_refresh
                && self.is_fresh(cached)
            {
                return Ok(cached.session.clone());
            }
            guard.as_ref().map_or(0, |c| c.generation)
        };

        let _refresh = slot.refresh.lock().await;
        {
            let guard = slot.current.read().await;
            if let Some(cached) = guard.as_ref()
                && cached.generation != seen_generation
                && self.is_fresh(cached)
            {
                return Ok(cached.session.clone());
            }
        }

        let session = login().await?;
        let mut guard = slot.current.write().await;
        *guard = Some(Cached {
            session: session.clone(),
            established_at: self.clock.now(),
            generation: seen_generation + 1,
        });
        Ok(session)
    }
}
