use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;
use ulid::Ulid;

use crate::client::{BookingClient, ClientError, ProviderReply, SessionCache, SessionError};
use crate::clock::Clock;
use crate::model::{AccountId, Candidate, ResourceId};

/// Booked minutes per account per day the provider tolerates.
pub const MAX_BOOKED_MINUTES_PER_DAY: i64 = 180;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBooking {
    pub reference: String,
    pub account: AccountId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resource: ResourceId,
}

#[derive(Default)]
struct LedgerState {
    bookings: HashMap<(DateTime<Utc>, ResourceId), LedgerBooking>,
    minutes: HashMap<(AccountId, NaiveDate), i64>,
}

#[derive(Debug, Clone)]
struct LedgerSession {
    #[allow(dead_code)]
    token: Ulid,
}

/// In-process provider: one winner per (slot, court), a daily booked-duration
/// cap per account, and a session required for every submission.
pub struct LedgerClient {
    clock: Arc<dyn Clock>,
    sessions: SessionCache<LedgerSession>,
    state: Mutex<LedgerState>,
    /// Submissions before this instant are declined as "not open yet".
    opens_at: Option<DateTime<Utc>>,
    round_trip: Duration,
    locked_out: Mutex<HashSet<AccountId>>,
    logins: AtomicUsize,
    submissions: AtomicUsize,
}

impl LedgerClient {
    pub fn new(clock: Arc<dyn Clock>, session_ttl: Duration) -> Self {
        Self {
            sessions: SessionCache::new(session_ttl, clock.clone()),
            clock,
            state: Mutex::new(LedgerState::default()),
            opens_at: None,
            round_trip: Duration::from_millis(40),
            locked_out: Mutex::new(HashSet::new()),
            logins: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
        }
    }

    pub fn opening_at(mut self, instant: DateTime<Utc>) -> Self {
        self.opens_at = Some(instant);
        self
    }

    /// Make every login for `account` fail.
    pub fn lock_out(&self, account: &AccountId) {
        if let Ok(mut set) = self.locked_out.lock() {
            set.insert(account.clone());
        }
    }

    /// Occupy a slot as if another member had booked it.
    pub fn occupy(&self, start: DateTime<Utc>, end: DateTime<Utc>, resource: ResourceId) {
        if let Ok(mut state) = self.state.lock() {
            state.bookings.insert(
                (start, resource),
                LedgerBooking {
                    reference: "external".into(),
                    account: AccountId::new("someone-else"),
                    start,
                    end,
                    resource,
                },
            );
        }
    }

    pub fn bookings(&self) -> Vec<LedgerBooking> {
        let mut all: Vec<LedgerBooking> = self
            .state
            .lock()
            .map(|s| s.bookings.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|b| (b.start, b.resource));
        all
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    fn book(&self, account: &AccountId, candidate: &Candidate) -> Result<ProviderReply, ClientError> {
        let start = candidate.start.with_timezone(&Utc);
        let end = candidate.end.with_timezone(&Utc);
        let mut state = self
            .state
            .lock()
            .map_err(|_| ClientError::Transport("ledger poisoned".into()))?;

        if state.bookings.contains_key(&(start, candidate.resource)) {
            return Ok(ProviderReply::Declined {
                message: "Slot already booked".into(),
            });
        }
        let day = (account.clone(), candidate.start.date_naive());
        let wanted = (end - start).num_minutes();
        let used = state.minutes.get(&day).copied().unwrap_or(0);
        if used + wanted > MAX_BOOKED_MINUTES_PER_DAY {
            return Err(ClientError::DurationExceeded(format!(
                "Reservation restricted to {MAX_BOOKED_MINUTES_PER_DAY} minutes"
            )));
        }

        let reference = Ulid::new().to_string();
        state.minutes.insert(day, used + wanted);
        state.bookings.insert(
            (start, candidate.resource),
            LedgerBooking {
                reference: reference.clone(),
                account: account.clone(),
                start,
                end,
                resource: candidate.resource,
            },
        );
        Ok(ProviderReply::Confirmed {
            reference: Some(reference),
        })
    }
}

#[async_trait]
impl BookingClient for LedgerClient {
    async fn ensure_session(&self, account: &AccountId, force_refresh: bool) -> Result<(), SessionError> {
        self.sessions
            .get_or_refresh(account, force_refresh, move || async move {
                let denied = self
                    .locked_out
                    .lock()
                    .map(|set| set.contains(account))
                    .unwrap_or(true);
                if denied {
                    return Err(SessionError {
                        account: account.clone(),
                        reason: "login refused".into(),
                    });
                }
                self.logins.fetch_add(1, Ordering::SeqCst);
                debug!("ledger login for {account}");
                Ok(LedgerSession { token: Ulid::new() })
            })
            .await
            .map(|_| ())
    }

    async fn attempt_book(
        &self,
        account: &AccountId,
        candidate: &Candidate,
    ) -> Result<ProviderReply, ClientError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if self.sessions.current(account).await.is_none() {
            return Err(ClientError::Session("not logged in".into()));
        }
        tokio::time::sleep(self.round_trip).await;
        if let Some(opens_at) = self.opens_at
            && self.clock.now() < opens_at
        {
            return Ok(ProviderReply::Declined {
                message: "Booking window is not open yet".into(),
            });
        }
        self.book(account, candidate)
    }
}
