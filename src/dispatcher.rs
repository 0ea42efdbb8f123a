use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::client::{BookingClient, SessionError};
use crate::engine::{RaceExecutor, expand};
use crate::model::{AccountId, RaceResult, ReservationRequest};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::observability::SESSION_FAILURES_TOTAL;
use crate::store::Store;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub booked: usize,
    pub failed: usize,
    /// Accounts with no session for this run; their requests were not raced.
    pub session_failures: Vec<AccountId>,
    /// Requests left untouched because their account had no session.
    pub not_attempted: usize,
    /// Races released past the opening instant plus the safety margin.
    pub started_late: usize,
}

impl DispatchReport {
    fn merge(&mut self, other: DispatchReport) {
        self.booked += other.booked;
        self.failed += other.failed;
        self.session_failures.extend(other.session_failures);
        self.not_attempted += other.not_attempted;
        self.started_late += other.started_late;
    }
}

struct Settled {
    booked: bool,
    started_late: bool,
}

/// Fans the day's eligible requests out into per-account jobs, one race per request.
#[derive(Clone)]
pub struct RequestDispatcher {
    store: Arc<dyn Store>,
    client: Arc<dyn BookingClient>,
    notifier: Arc<dyn Notifier>,
    catalog: Arc<Catalog>,
    executor: Arc<RaceExecutor>,
    slot: chrono::Duration,
    max_concurrent_accounts: usize,
}

impl RequestDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn BookingClient>,
        notifier: Arc<dyn Notifier>,
        catalog: Arc<Catalog>,
        executor: Arc<RaceExecutor>,
        slot: chrono::Duration,
    ) -> Self {
        Self {
            store,
            client,
            notifier,
            catalog,
            executor,
            slot,
            max_concurrent_accounts: 6,
        }
    }

    pub fn with_max_concurrent_accounts(mut self, n: usize) -> Self {
        self.max_concurrent_accounts = n.max(1);
        self
    }

    pub async fn dispatch(&self, requests: Vec<ReservationRequest>, opening: DateTime<Utc>) -> DispatchReport {
        let mut by_account: BTreeMap<AccountId, Vec<ReservationRequest>> = BTreeMap::new();
        for request in requests {
            by_account.entry(request.account.clone()).or_default().push(request);
        }
        info!(
            "dispatching {} accounts for opening {opening}",
            by_account.len()
        );

        let permits = Arc::new(Semaphore::new(self.max_concurrent_accounts));
        let mut jobs = JoinSet::new();
        for (account, requests) in by_account {
            let this = self.clone();
            let permits = permits.clone();
            jobs.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return DispatchReport::default();
                };
                this.run_account(account, requests, opening).await
            });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(account_report) => report.merge(account_report),
                Err(e) => error!("account job failed: {e}"),
            }
        }
        report
    }

    async fn run_account(
        &self,
        account: AccountId,
        requests: Vec<ReservationRequest>,
        opening: DateTime<Utc>,
    ) -> DispatchReport {
        if let Err(e) = self.establish_session(&account).await {
            error!("{e}, skipping {} requests", requests.len());
            metrics::counter!(SESSION_FAILURES_TOTAL).increment(1);
            self.notifier.notify(Notification::to_account(
                account.clone(),
                NotificationKind::SessionFailed { reason: e.reason },
            ));
            return DispatchReport {
                session_failures: vec![account],
                not_attempted: requests.len(),
                ..Default::default()
            };
        }

        let mut races = JoinSet::new();
        for request in requests {
            let this = self.clone();
            races.spawn(async move { this.run_request(request, opening).await });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = races.join_next().await {
            match joined {
                Ok(settled) => {
                    if settled.booked {
                        report.booked += 1;
                    } else {
                        report.failed += 1;
                    }
                    if settled.started_late {
                        report.started_late += 1;
                    }
                }
                Err(e) => {
                    error!("race for {account} failed: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Use the cached session, falling back to one forced refresh.
    async fn establish_session(&self, account: &AccountId) -> Result<(), SessionError> {
        match self.client.ensure_session(account, false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("{e}, retrying with a fresh login");
                self.client.ensure_session(account, true).await
            }
        }
    }

    /// Every candidate of the request is raced; the executor bounds how many
    /// are in flight at once.
    async fn run_request(&self, request: ReservationRequest, opening: DateTime<Utc>) -> Settled {
        let candidates = expand(&request, &self.catalog, self.slot);
        let result = self.executor.race(&request, candidates, opening).await;
        let started_late = result.started_late;
        Settled {
            booked: self.settle(request, result).await,
            started_late,
        }
    }

    /// Remove a won request exactly once; keep a lost one for the operator.
    async fn settle(&self, request: ReservationRequest, result: RaceResult) -> bool {
        match result.winner {
            Some(slot) => {
                match self.store.remove(&request).await {
                    Ok(true) => {}
                    Ok(false) => warn!("booked request {} was already gone from the store", request.id),
                    Err(e) => error!("failed to remove booked request {}: {e}", request.id),
                }
                info!("booked {slot} for {}", request.account);
                self.notifier.notify(Notification::to_account(
                    request.account.clone(),
                    NotificationKind::Booked { request, slot },
                ));
                true
            }
            None => {
                let attempts = result.describe_attempts();
                warn!(
                    "total race failure for request {} ({}):\n{attempts}",
                    request.id, request.account
                );
                self.notifier.notify(Notification::to_account(
                    request.account.clone(),
                    NotificationKind::RaceFailed { request, attempts },
                ));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{AnchoredClock, Clock};
    use crate::ledger::LedgerClient;
    use crate::model::ResourceId;
    use crate::notify::NotifyHub;
    use crate::store::{RequestStore, StoreError};
    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts removals on top of an in-memory store.
    struct CountingStore {
        inner: RequestStore,
        removes: AtomicUsize,
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn list_pending(&self) -> Result<Vec<ReservationRequest>, StoreError> {
            self.inner.list_pending().await
        }

        async fn add(&self, request: ReservationRequest) -> Result<bool, StoreError> {
            self.inner.add(request).await
        }

        async fn remove(&self, request: &ReservationRequest) -> Result<bool, StoreError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            self.inner.remove(request).await
        }
    }

    struct Fixture {
        store: Arc<CountingStore>,
        ledger: Arc<LedgerClient>,
        hub: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        dispatcher: RequestDispatcher,
    }

    fn opening() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 22, 11, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        fixture_with(|executor| executor)
    }

    fn fixture_with(tune: impl FnOnce(RaceExecutor) -> RaceExecutor) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::starting_at(opening() - chrono::Duration::seconds(5)));
        let store = Arc::new(CountingStore {
            inner: RequestStore::in_memory(),
            removes: AtomicUsize::new(0),
        });
        let ledger = Arc::new(LedgerClient::new(clock.clone(), Duration::from_secs(3600)).opening_at(opening()));
        let hub = Arc::new(NotifyHub::new());
        let executor = Arc::new(tune(RaceExecutor::new(ledger.clone(), clock.clone())));
        let dispatcher = RequestDispatcher::new(
            store.clone(),
            ledger.clone(),
            hub.clone(),
            Arc::new(Catalog::default()),
            executor,
            chrono::Duration::hours(1),
        );
        Fixture {
            store,
            ledger,
            hub,
            clock,
            dispatcher,
        }
    }

    fn request(account: &str, hour: u32, court: u32) -> ReservationRequest {
        ReservationRequest::new(
            FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 5, 24, hour, 0, 0)
                .unwrap(),
            ResourceId(court),
            AccountId::new(account),
            Utc.with_ymd_and_hms(2024, 5, 20, 9, 0, 0).unwrap(),
        )
    }

    fn occupy_hour(ledger: &LedgerClient, hour: u32, court: u32) {
        let start = Utc.with_ymd_and_hms(2024, 5, 24, hour, 0, 0).unwrap();
        ledger.occupy(start, start + chrono::Duration::hours(1), ResourceId(court));
    }

    async fn seed(f: &Fixture, requests: &[ReservationRequest]) {
        for r in requests {
            assert!(f.store.add(r.clone()).await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn winner_removed_once_and_loser_kept() {
        let f = fixture();
        let mut all = f.hub.subscribe_all();
        let won = request("mike", 10, 46166);
        let lost = request("zafar", 10, 46164);
        for (hour, court) in [(10, 46164), (10, 46165), (11, 46164), (11, 46165)] {
            occupy_hour(&f.ledger, hour, court);
        }
        seed(&f, &[won.clone(), lost.clone()]).await;

        let report = f
            .dispatcher
            .dispatch(f.store.list_pending().await.unwrap(), opening())
            .await;

        assert_eq!(report.booked, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(f.store.removes.load(Ordering::SeqCst), 1);
        let pending = f.store.list_pending().await.unwrap();
        assert_eq!(pending, vec![lost.clone()]);

        let mut kinds = Vec::new();
        while let Ok(n) = all.try_recv() {
            kinds.push(n.kind);
        }
        assert!(kinds.iter().any(|k| matches!(k, NotificationKind::Booked { request, .. } if request.id == won.id)));
        let failed = kinds
            .iter()
            .find_map(|k| match k {
                NotificationKind::RaceFailed { request, attempts } if request.id == lost.id => Some(attempts.clone()),
                _ => None,
            })
            .unwrap();
        let lines: Vec<&str> = failed.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|line| line.contains("rejected, slot taken")));
    }

    /// Loses the cached session once, then behaves like the ledger.
    struct StaleSessionClient {
        inner: Arc<LedgerClient>,
        refreshes: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl BookingClient for StaleSessionClient {
        async fn ensure_session(&self, account: &AccountId, force_refresh: bool) -> Result<(), SessionError> {
            let first = {
                let mut refreshes = self.refreshes.lock().unwrap();
                refreshes.push(force_refresh);
                refreshes.len() == 1
            };
            if first && !force_refresh {
                return Err(SessionError {
                    account: account.clone(),
                    reason: "session expired".into(),
                });
            }
            self.inner.ensure_session(account, force_refresh).await
        }

        async fn attempt_book(
            &self,
            account: &AccountId,
            candidate: &crate::model::Candidate,
        ) -> Result<crate::client::ProviderReply, crate::client::ClientError> {
            self.inner.attempt_book(account, candidate).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_recovers_with_forced_login() {
        let f = fixture();
        let client = Arc::new(StaleSessionClient {
            inner: f.ledger.clone(),
            refreshes: std::sync::Mutex::new(Vec::new()),
        });
        let dispatcher = RequestDispatcher::new(
            f.store.clone(),
            client.clone(),
            f.hub.clone(),
            Arc::new(Catalog::default()),
            Arc::new(RaceExecutor::new(client.clone(), f.clock.clone())),
            chrono::Duration::hours(1),
        );
        let req = request("mike", 10, 46166);
        seed(&f, &[req.clone()]).await;

        let report = dispatcher.dispatch(vec![req], opening()).await;

        assert_eq!(report.booked, 1);
        assert!(report.session_failures.is_empty());
        assert_eq!(*client.refreshes.lock().unwrap(), vec![false, true]);
        assert_eq!(f.ledger.bookings().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn alternate_court_tried_with_one_attempt_in_flight() {
        let f = fixture_with(|executor| executor.with_max_concurrent(1));
        occupy_hour(&f.ledger, 10, 46166);
        let req = request("mike", 10, 46166);
        seed(&f, &[req.clone()]).await;

        let report = f.dispatcher.dispatch(vec![req], opening()).await;

        assert_eq!(report.booked, 1);
        let ours: Vec<u32> = f
            .ledger
            .bookings()
            .into_iter()
            .filter(|b| b.reference != "external")
            .map(|b| b.resource.0)
            .collect();
        assert_eq!(ours, vec![46167]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_release_is_counted() {
        let f = fixture();
        let req = request("mike", 10, 46166);
        seed(&f, &[req.clone()]).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let report = f.dispatcher.dispatch(vec![req], opening()).await;

        assert_eq!(report.booked, 1);
        assert_eq!(report.started_late, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_failure_skips_only_that_account() {
        let f = fixture();
        let mut zafar_rx = f.hub.subscribe(&AccountId::new("zafar"));
        f.ledger.lock_out(&AccountId::new("zafar"));
        let mike = request("mike", 10, 46166);
        let zafar = request("zafar", 12, 46168);
        seed(&f, &[mike.clone(), zafar.clone()]).await;

        let report = f.dispatcher.dispatch(vec![mike, zafar.clone()], opening()).await;

        assert_eq!(report.booked, 1);
        assert_eq!(report.session_failures, vec![AccountId::new("zafar")]);
        assert_eq!(report.not_attempted, 1);
        assert_eq!(f.store.list_pending().await.unwrap(), vec![zafar]);
        assert!(f.ledger.bookings().iter().all(|b| b.account == AccountId::new("mike")));
        assert!(matches!(
            zafar_rx.try_recv().unwrap().kind,
            NotificationKind::SessionFailed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn accounts_beyond_cap_still_run() {
        let mut f = fixture();
        f.dispatcher = f.dispatcher.clone().with_max_concurrent_accounts(1);
        let requests = vec![request("mike", 10, 46166), request("zafar", 10, 46168)];
        seed(&f, &requests).await;

        let report = f.dispatcher.dispatch(requests, opening()).await;

        assert_eq!(report.booked, 2);
        assert!(f.store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn requests_of_one_account_race_concurrently() {
        let f = fixture();
        let requests = vec![request("mike", 10, 46166), request("mike", 14, 46164)];
        seed(&f, &requests).await;

        let report = f.dispatcher.dispatch(requests, opening()).await;

        assert_eq!(report.booked, 2);
        assert_eq!(f.ledger.logins(), 1);
        assert_eq!(f.ledger.bookings().len(), 2);
    }
}
