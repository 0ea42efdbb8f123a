use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::outcome::classify;
use super::stagger::StaggerPolicy;
use crate::client::BookingClient;
use crate::clock::{Clock, sleep_until};
use crate::config::limits::OPPORTUNITY_WINDOW;
use crate::model::{AccountId, AttemptOutcome, AttemptRecord, Candidate, RaceResult, ReservationRequest};
use crate::observability::{self, DUPLICATE_SUCCESSES_TOTAL, RACE_DURATION_SECONDS, RACES_TOTAL};

const NO_WINNER: usize = usize::MAX;

/// Per-race shared state. `settled` is the cancellation signal checked right
/// before submission; `winner` holds the rank of the first observed success.
struct RaceState {
    settled: AtomicBool,
    winner: AtomicUsize,
}

impl RaceState {
    fn new() -> Self {
        Self {
            settled: AtomicBool::new(false),
            winner: AtomicUsize::new(NO_WINNER),
        }
    }

    /// Returns true if this success is the race winner.
    fn claim(&self, rank: usize) -> bool {
        self.settled.store(true, Ordering::SeqCst);
        self.winner
            .compare_exchange(NO_WINNER, rank, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Runs every candidate of one request concurrently, staggered by rank,
/// and stops submitting once one of them succeeds.
pub struct RaceExecutor {
    client: Arc<dyn BookingClient>,
    clock: Arc<dyn Clock>,
    stagger: StaggerPolicy,
    max_concurrent: usize,
    late_tolerance: Duration,
    attempt_timeout: Duration,
}

impl RaceExecutor {
    pub fn new(client: Arc<dyn BookingClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            stagger: StaggerPolicy::default(),
            max_concurrent: 4,
            late_tolerance: Duration::from_secs(30),
            attempt_timeout: OPPORTUNITY_WINDOW,
        }
    }

    pub fn with_stagger(mut self, stagger: StaggerPolicy) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_late_tolerance(mut self, tolerance: Duration) -> Self {
        self.late_tolerance = tolerance;
        self
    }

    /// Longest a single provider call may stay unanswered before it counts as
    /// a transient failure.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Race `candidates` (ranked, see [`super::expand`]) for `request`.
    ///
    /// Nothing is submitted before `opening`. Each attempt is one provider
    /// round trip, bounded by the attempt timeout, and is never retried here.
    /// Attempts that have not been
    /// submitted when a sibling wins come back as `Cancelled`; attempts already
    /// in flight run to completion and are reported as the provider answered.
    pub async fn race(
        &self,
        request: &ReservationRequest,
        candidates: Vec<Candidate>,
        opening: DateTime<Utc>,
    ) -> RaceResult {
        sleep_until(self.clock.as_ref(), opening).await;

        let released = self.clock.now();
        let tolerance = chrono::Duration::from_std(self.late_tolerance).unwrap_or(chrono::Duration::MAX);
        let started_late = released > opening + tolerance;
        if started_late {
            warn!(
                "race for request {} released {}ms after opening {opening}",
                request.id,
                (released - opening).num_milliseconds()
            );
        }

        let timer = tokio::time::Instant::now();
        let state = Arc::new(RaceState::new());
        let permits = Arc::new(Semaphore::new(self.max_concurrent));

        let handles: Vec<_> = candidates
            .iter()
            .cloned()
            .map(|candidate| {
                let delay = self.stagger.delay(candidate.rank);
                tokio::spawn(run_attempt(
                    self.client.clone(),
                    request.account.clone(),
                    candidate,
                    delay,
                    self.attempt_timeout,
                    state.clone(),
                    permits.clone(),
                ))
            })
            .collect();

        let joined = futures::future::join_all(handles).await;

        let mut attempts = Vec::with_capacity(candidates.len());
        let mut anomalies = Vec::new();
        let winner_rank = state.winner.load(Ordering::SeqCst);
        for (candidate, joined) in candidates.into_iter().zip(joined) {
            let outcome = match joined {
                Ok(AttemptOutcome::Success { reference }) if candidate.rank != winner_rank => {
                    anomalies.push(candidate.clone());
                    AttemptOutcome::DuplicateSuccess { reference }
                }
                Ok(outcome) => outcome,
                Err(e) => AttemptOutcome::TransientFailure(format!("attempt task failed: {e}")),
            };
            observability::record_attempt(&outcome);
            attempts.push(AttemptRecord { candidate, outcome });
        }

        let winner = attempts
            .iter()
            .find(|a| a.candidate.rank == winner_rank)
            .map(|a| a.candidate.clone());

        let result = if winner.is_some() { "won" } else { "failed" };
        metrics::counter!(RACES_TOTAL, "result" => result).increment(1);
        metrics::histogram!(RACE_DURATION_SECONDS).record(timer.elapsed().as_secs_f64());

        RaceResult {
            request_id: request.id,
            winner,
            attempts,
            anomalies,
            started_late,
        }
    }
}

async fn run_attempt(
    client: Arc<dyn BookingClient>,
    account: AccountId,
    candidate: Candidate,
    delay: Duration,
    timeout: Duration,
    state: Arc<RaceState>,
    permits: Arc<Semaphore>,
) -> AttemptOutcome {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let Ok(_permit) = permits.acquire().await else {
        return AttemptOutcome::Cancelled;
    };
    if state.settled.load(Ordering::SeqCst) {
        debug!("{candidate} cancelled before submission");
        return AttemptOutcome::Cancelled;
    }

    let outcome = match tokio::time::timeout(timeout, client.attempt_book(&account, &candidate)).await {
        Ok(reply) => classify(reply),
        Err(_) => AttemptOutcome::TransientFailure(format!("no answer within {}ms", timeout.as_millis())),
    };
    match &outcome {
        AttemptOutcome::Success { .. } => {
            if state.claim(candidate.rank) {
                info!("{account} won {candidate}");
            } else {
                metrics::counter!(DUPLICATE_SUCCESSES_TOTAL).increment(1);
                warn!("{account} also confirmed {candidate} after the race was won");
            }
        }
        AttemptOutcome::Rejected(reason) => info!("{account} {candidate} rejected: {reason}"),
        AttemptOutcome::TransientFailure(e) => warn!("{account} {candidate} failed: {e}"),
        AttemptOutcome::Cancelled | AttemptOutcome::DuplicateSuccess { .. } => {}
    }
    outcome
}
