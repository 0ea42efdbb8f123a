use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Provider account that owns requests and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-side court identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user's intent to claim one court slot once it opens.
///
/// `target` is a `DateTime<FixedOffset>`, so a request can never be built
/// without an explicit zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub target: DateTime<FixedOffset>,
    pub resource: ResourceId,
    pub account: AccountId,
    pub created_at: DateTime<Utc>,
}

/// Uniqueness key among live requests: (slot instant, court, account).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub target: DateTime<Utc>,
    pub resource: ResourceId,
    pub account: AccountId,
}

impl ReservationRequest {
    pub fn new(
        target: DateTime<FixedOffset>,
        resource: ResourceId,
        account: AccountId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            target,
            resource,
            account,
            created_at,
        }
    }

    /// Two requests for the same instant compare equal even when written in different zones.
    pub fn key(&self) -> RequestKey {
        RequestKey {
            target: self.target.with_timezone(&Utc),
            resource: self.resource,
            account: self.account.clone(),
        }
    }

    /// Calendar date of the slot as seen from `zone`.
    pub fn target_date_in(&self, zone: &FixedOffset) -> NaiveDate {
        self.target.with_timezone(zone).date_naive()
    }
}

/// One concrete (slot, court) pair tried during a race. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// 0 is the unmodified original; lower ranks have priority.
    pub rank: usize,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub resource: ResourceId,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} court {} {}..{}",
            self.rank,
            self.resource,
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Why the provider declined an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Someone (possibly a sibling attempt) already holds the slot.
    SlotTaken(String),
    /// The account hit the provider's booked-duration window.
    DurationExceeded(String),
    /// Any other explicit decline: booking policy, rate limit, closed window.
    Declined(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::SlotTaken(m) => write!(f, "slot taken: {m}"),
            RejectReason::DurationExceeded(m) => write!(f, "duration exceeded: {m}"),
            RejectReason::Declined(m) => write!(f, "declined: {m}"),
        }
    }
}

/// Result of exactly one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success { reference: Option<String> },
    Rejected(RejectReason),
    TransientFailure(String),
    /// Pre-empted by a sibling success before submission.
    Cancelled,
    /// Confirmed by the provider after a sibling had already won the race.
    DuplicateSuccess { reference: Option<String> },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success { .. } => "success",
            AttemptOutcome::Rejected(_) => "rejected",
            AttemptOutcome::TransientFailure(_) => "transient_failure",
            AttemptOutcome::Cancelled => "cancelled",
            AttemptOutcome::DuplicateSuccess { .. } => "duplicate_success",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success { reference: Some(r) } => write!(f, "success ({r})"),
            AttemptOutcome::Success { reference: None } => f.write_str("success"),
            AttemptOutcome::Rejected(reason) => write!(f, "rejected, {reason}"),
            AttemptOutcome::TransientFailure(e) => write!(f, "transient failure: {e}"),
            AttemptOutcome::Cancelled => f.write_str("cancelled"),
            AttemptOutcome::DuplicateSuccess { reference: Some(r) } => write!(f, "duplicate success ({r})"),
            AttemptOutcome::DuplicateSuccess { reference: None } => f.write_str("duplicate success"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub candidate: Candidate,
    pub outcome: AttemptOutcome,
}

/// Aggregate of one request's race. Consumed immediately, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceResult {
    pub request_id: Ulid,
    /// The first-observed success, if any.
    pub winner: Option<Candidate>,
    /// One record per candidate, in rank order. Only the winner's record is
    /// `Success`; later confirmations are recorded as `DuplicateSuccess`.
    pub attempts: Vec<AttemptRecord>,
    /// Candidates whose provider call also reported success after the winner.
    pub anomalies: Vec<Candidate>,
    /// Attempts were released later than the opening instant plus the safety margin.
    pub started_late: bool,
}

impl RaceResult {
    pub fn is_success(&self) -> bool {
        self.winner.is_some()
    }

    pub fn count(&self, label: &str) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome.label() == label)
            .count()
    }

    /// One line per candidate, used in failure reports.
    pub fn describe_attempts(&self) -> String {
        self.attempts
            .iter()
            .map(|a| format!("{}: {}", a.candidate, a.outcome))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The event types of the request store. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RequestAdded { request: ReservationRequest },
    RequestRemoved { id: Ulid },
}
