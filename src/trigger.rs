use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::OpeningSchedule;
use crate::clock::{Clock, sleep_until};
use crate::config::limits::MAX_STORE_RETRIES;
use crate::dispatcher::{DispatchReport, RequestDispatcher};
use crate::model::ReservationRequest;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::observability::{EXPIRED_REQUESTS_TOTAL, STORE_FAILURES_TOTAL, TRIGGER_LATENESS_SECONDS};
use crate::store::{Store, StoreError};

const MAX_STORE_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    ArmedForToday {
        opening: DateTime<Utc>,
        arm_at: DateTime<Utc>,
    },
    Firing {
        opening: DateTime<Utc>,
    },
    Sleeping,
}

/// What one daily run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyReport {
    pub opening: DateTime<Utc>,
    pub expired: usize,
    /// Pending requests for later dates, left for a future opening.
    pub skipped: usize,
    pub dispatch: DispatchReport,
    /// Set when the store could not be read and the run was given up.
    pub store_error: Option<String>,
}

impl DailyReport {
    fn new(opening: DateTime<Utc>) -> Self {
        Self {
            opening,
            expired: 0,
            skipped: 0,
            dispatch: DispatchReport::default(),
            store_error: None,
        }
    }
}

/// Wakes once per day shortly before the opening instant and hands the
/// eligible requests to the dispatcher.
pub struct DailyTrigger {
    schedule: OpeningSchedule,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    dispatcher: RequestDispatcher,
    notifier: Arc<dyn Notifier>,
    state: TriggerState,
    last_fired: Option<DateTime<Utc>>,
    store_retry_base: Duration,
}

impl DailyTrigger {
    pub fn new(
        schedule: OpeningSchedule,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Store>,
        dispatcher: RequestDispatcher,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            schedule,
            clock,
            store,
            dispatcher,
            notifier,
            state: TriggerState::Idle,
            last_fired: None,
            store_retry_base: Duration::from_secs(1),
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn last_fired(&self) -> Option<DateTime<Utc>> {
        self.last_fired
    }

    /// Pick the next opening to fire for and move to `ArmedForToday`.
    ///
    /// Started after today's opening that was never fired, the trigger still
    /// fires for it at once while its eligible date lies ahead; the races are
    /// then flagged as started late. An opening already fired is never picked twice.
    pub fn arm(&mut self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = self.clock.now();
        let today = self.schedule.today(now);
        let todays_opening = self.schedule.opening_on(today);
        let missed = now >= todays_opening
            && self.last_fired.is_none_or(|last| last < todays_opening)
            && self.schedule.eligible_date(todays_opening) > today;
        let mut opening = if missed {
            warn!("started after opening {todays_opening}, firing for it late");
            todays_opening
        } else {
            self.schedule.next_opening(now)
        };
        if let Some(last) = self.last_fired
            && opening <= last
        {
            opening = self.schedule.next_opening(last);
        }
        let arm_at = self.schedule.arm_at(opening);
        self.state = TriggerState::ArmedForToday { opening, arm_at };
        info!("armed for opening {opening}, waking at {arm_at}");
        (opening, arm_at)
    }

    /// Arm, wait, fire once. `None` if shutdown arrived while waiting.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> Option<DailyReport> {
        let (opening, arm_at) = self.arm();

        let interrupted = tokio::select! {
            _ = sleep_until(self.clock.as_ref(), arm_at) => false,
            _ = shutdown.cancelled() => true,
        };
        if interrupted {
            info!("shutdown while armed for {opening}");
            self.state = TriggerState::Idle;
            return None;
        }

        self.state = TriggerState::Firing { opening };
        self.last_fired = Some(opening);

        let now = self.clock.now();
        let lateness = (now - arm_at).to_std().unwrap_or_default();
        metrics::histogram!(TRIGGER_LATENESS_SECONDS).record(lateness.as_secs_f64());
        let margin = chrono::Duration::from_std(self.schedule.safety_margin).unwrap_or_else(|_| chrono::Duration::zero());
        if now > opening + margin {
            warn!("trigger fired {lateness:?} after arm time, attempts will start late");
        }

        let report = self.fire(opening, shutdown).await;
        self.notifier.notify(Notification::broadcast(NotificationKind::DailyRunComplete {
            opening,
            booked: report.dispatch.booked,
            failed: report.dispatch.failed,
            expired: report.expired,
        }));
        info!(
            "run for {opening} done: {} booked, {} failed, {} expired, {} skipped",
            report.dispatch.booked, report.dispatch.failed, report.expired, report.skipped
        );
        self.state = TriggerState::Sleeping;
        Some(report)
    }

    async fn fire(&self, opening: DateTime<Utc>, shutdown: &CancellationToken) -> DailyReport {
        let mut report = DailyReport::new(opening);
        let pending = match self.load_pending(shutdown).await {
            Ok(pending) => pending,
            Err(e) => {
                error!("giving up on opening {opening}: {e}");
                report.store_error = Some(e.to_string());
                return report;
            }
        };

        let mut eligible = Vec::new();
        for request in pending {
            if self.schedule.is_expired(&request, opening) {
                self.expire(request).await;
                report.expired += 1;
            } else if self.schedule.is_eligible(&request, opening) {
                eligible.push(request);
            } else {
                report.skipped += 1;
            }
        }

        if !eligible.is_empty() {
            report.dispatch = self.dispatcher.dispatch(eligible, opening).await;
        }
        report
    }

    /// Drop a request whose date has passed. It is never raced.
    async fn expire(&self, request: ReservationRequest) {
        match self.store.remove(&request).await {
            Ok(_) => {
                metrics::counter!(EXPIRED_REQUESTS_TOTAL).increment(1);
                info!("expired request {} for {}", request.id, request.account);
                self.notifier.notify(Notification::to_account(
                    request.account.clone(),
                    NotificationKind::Expired { request },
                ));
            }
            Err(e) => error!("failed to remove expired request {}: {e}", request.id),
        }
    }

    async fn load_pending(&self, shutdown: &CancellationToken) -> Result<Vec<ReservationRequest>, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.store.list_pending().await {
                Ok(pending) => return Ok(pending),
                Err(e) => {
                    metrics::counter!(STORE_FAILURES_TOTAL).increment(1);
                    attempt += 1;
                    if attempt > MAX_STORE_RETRIES {
                        return Err(e);
                    }
                    let backoff = self
                        .store_retry_base
                        .saturating_mul(1 << (attempt - 1).min(16))
                        .min(MAX_STORE_BACKOFF);
                    warn!("reading pending requests failed ({e}), retry {attempt}/{MAX_STORE_RETRIES} in {backoff:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.cancelled() => return Err(e),
                    }
                }
            }
        }
    }

    /// Fire every day until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            if self.run_cycle(&shutdown).await.is_none() {
                break;
            }
        }
        info!("daily trigger stopped");
    }
}
