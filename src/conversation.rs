use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use tracing::info;
use ulid::Ulid;

use crate::catalog::{Catalog, OpeningSchedule, Resource};
use crate::clock::Clock;
use crate::model::{AccountId, ReservationRequest, ResourceId};
use crate::store::{Store, StoreError};

pub type ChatId = i64;

#[derive(Debug)]
pub enum SelectionError {
    NoSelection,
    Expired,
    OutOfOrder(&'static str),
    DayNotBookable(NaiveDate),
    UnknownResource(ResourceId),
    HourNotBookable(u32),
    /// A live request for the same slot, court and account already exists.
    DuplicateRequest,
    NotFound(Ulid),
    Store(StoreError),
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionError::NoSelection => f.write_str("no booking in progress"),
            SelectionError::Expired => f.write_str("selection timed out, start again"),
            SelectionError::OutOfOrder(m) => f.write_str(m),
            SelectionError::DayNotBookable(d) => write!(f, "{d} cannot be booked"),
            SelectionError::UnknownResource(r) => write!(f, "unknown court {r}"),
            SelectionError::HourNotBookable(h) => write!(f, "{h}:00 is not a bookable hour"),
            SelectionError::DuplicateRequest => f.write_str("that slot is already queued"),
            SelectionError::NotFound(id) => write!(f, "no pending request {id}"),
            SelectionError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SelectionError {}

impl From<StoreError> for SelectionError {
    fn from(e: StoreError) -> Self {
        SelectionError::Store(e)
    }
}

#[derive(Debug, Clone)]
struct Selection {
    account: AccountId,
    day: Option<NaiveDate>,
    resource: Option<ResourceId>,
    touched: DateTime<Utc>,
}

/// Per-chat, step-by-step construction of a reservation request:
/// day, then court, then hour. Abandoned selections time out.
pub struct Conversations {
    catalog: Arc<Catalog>,
    schedule: OpeningSchedule,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    selections: DashMap<ChatId, Selection>,
}

impl Conversations {
    pub fn new(catalog: Arc<Catalog>, schedule: OpeningSchedule, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog,
            schedule,
            clock,
            ttl: chrono::Duration::minutes(10),
            selections: DashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Start (or restart) a selection and return the days on offer.
    pub fn begin(&self, chat: ChatId, account: AccountId) -> Vec<NaiveDate> {
        let now = self.clock.now();
        self.selections.insert(
            chat,
            Selection {
                account,
                day: None,
                resource: None,
                touched: now,
            },
        );
        self.schedule.bookable_days(now)
    }

    fn touch(&self, chat: ChatId) -> Result<dashmap::mapref::one::RefMut<'_, ChatId, Selection>, SelectionError> {
        let now = self.clock.now();
        let stale = match self.selections.get(&chat) {
            Some(selection) => now - selection.touched > self.ttl,
            None => return Err(SelectionError::NoSelection),
        };
        if stale {
            self.selections.remove(&chat);
            return Err(SelectionError::Expired);
        }
        let mut selection = self.selections.get_mut(&chat).ok_or(SelectionError::NoSelection)?;
        selection.touched = now;
        Ok(selection)
    }

    /// Pick a day; returns the courts to choose from.
    pub fn choose_day(&self, chat: ChatId, day: NaiveDate) -> Result<Vec<Resource>, SelectionError> {
        if !self.schedule.bookable_days(self.clock.now()).contains(&day) {
            return Err(SelectionError::DayNotBookable(day));
        }
        let mut selection = self.touch(chat)?;
        selection.day = Some(day);
        selection.resource = None;
        Ok(self.catalog.resources().to_vec())
    }

    /// Pick a court; returns the bookable hours.
    pub fn choose_resource(&self, chat: ChatId, resource: ResourceId) -> Result<Vec<u32>, SelectionError> {
        if self.catalog.get(resource).is_none() {
            return Err(SelectionError::UnknownResource(resource));
        }
        let mut selection = self.touch(chat)?;
        if selection.day.is_none() {
            return Err(SelectionError::OutOfOrder("choose a day first"));
        }
        selection.resource = Some(resource);
        Ok(self.schedule.bookable_hours())
    }

    /// Pick an hour, completing the selection.
    pub fn choose_hour(&self, chat: ChatId, hour: u32) -> Result<ReservationRequest, SelectionError> {
        let now = self.clock.now();
        let request = {
            let selection = self.touch(chat)?;
            let (Some(day), Some(resource)) = (selection.day, selection.resource) else {
                return Err(SelectionError::OutOfOrder("choose a day and a court first"));
            };
            if !self.schedule.bookable_days(now).contains(&day) {
                return Err(SelectionError::DayNotBookable(day));
            }
            let target = self
                .schedule
                .slot_start(day, hour)
                .ok_or(SelectionError::HourNotBookable(hour))?;
            ReservationRequest::new(target, resource, selection.account.clone(), now)
        };
        self.selections.remove(&chat);
        Ok(request)
    }

    pub fn cancel(&self, chat: ChatId) -> bool {
        self.selections.remove(&chat).is_some()
    }

    /// Drop every selection idle longer than the TTL.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.selections.len();
        self.selections.retain(|_, s| now - s.touched <= self.ttl);
        before - self.selections.len()
    }

    /// Queue a completed request.
    pub async fn submit(&self, store: &dyn Store, request: ReservationRequest) -> Result<ReservationRequest, SelectionError> {
        if !store.add(request.clone()).await? {
            return Err(SelectionError::DuplicateRequest);
        }
        info!(
            "{} queued court {} at {}",
            request.account,
            request.resource,
            request.target.format("%Y-%m-%d %H:%M")
        );
        Ok(request)
    }

    /// The account's pending requests, soonest first.
    pub async fn pending(&self, store: &dyn Store, account: &AccountId) -> Result<Vec<ReservationRequest>, SelectionError> {
        let mut mine: Vec<_> = store
            .list_pending()
            .await?
            .into_iter()
            .filter(|r| &r.account == account)
            .collect();
        mine.sort_by_key(|r| (r.target, r.resource));
        Ok(mine)
    }

    /// Withdraw one of the account's pending requests.
    pub async fn withdraw(
        &self,
        store: &dyn Store,
        account: &AccountId,
        id: Ulid,
    ) -> Result<ReservationRequest, SelectionError> {
        let request = self
            .pending(store, account)
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(SelectionError::NotFound(id))?;
        if !store.remove(&request).await? {
            return Err(SelectionError::NotFound(id));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::AnchoredClock;
    use crate::store::RequestStore;
    use chrono::TimeZone;
    use std::time::Duration;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn conversations(now: DateTime<Utc>) -> Conversations {
        Conversations::new(
            Arc::new(Catalog::default()),
            OpeningSchedule::default(),
            Arc::new(AnchoredClock::starting_at(now)),
        )
    }

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 22, 9, 0, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn full_selection_builds_request() {
        let conv = conversations(morning());
        let days = conv.begin(7, AccountId::new("mike"));
        assert_eq!(days, vec![date(24), date(25), date(26)]);

        let courts = conv.choose_day(7, date(24)).unwrap();
        assert_eq!(courts.len(), 6);
        let hours = conv.choose_resource(7, ResourceId(46166)).unwrap();
        assert_eq!(hours.first(), Some(&7));
        assert_eq!(hours.last(), Some(&21));

        let request = conv.choose_hour(7, 10).unwrap();
        assert_eq!(request.target, Utc.with_ymd_and_hms(2024, 5, 24, 10, 0, 0).unwrap());
        assert_eq!(request.resource, ResourceId(46166));
        assert_eq!(request.account, AccountId::new("mike"));
        // cleared on completion
        assert!(matches!(conv.choose_hour(7, 10), Err(SelectionError::NoSelection)));
    }

    #[tokio::test(start_paused = true)]
    async fn steps_must_come_in_order() {
        let conv = conversations(morning());
        assert!(matches!(
            conv.choose_day(1, date(24)),
            Err(SelectionError::NoSelection)
        ));
        conv.begin(1, AccountId::new("mike"));
        assert!(matches!(
            conv.choose_resource(1, ResourceId(46166)),
            Err(SelectionError::OutOfOrder(_))
        ));
        assert!(matches!(conv.choose_hour(1, 10), Err(SelectionError::OutOfOrder(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_values_outside_calendar() {
        let conv = conversations(morning());
        conv.begin(1, AccountId::new("mike"));
        assert!(matches!(
            conv.choose_day(1, date(23)),
            Err(SelectionError::DayNotBookable(_))
        ));
        conv.choose_day(1, date(24)).unwrap();
        assert!(matches!(
            conv.choose_resource(1, ResourceId(1)),
            Err(SelectionError::UnknownResource(_))
        ));
        conv.choose_resource(1, ResourceId(46164)).unwrap();
        assert!(matches!(conv.choose_hour(1, 23), Err(SelectionError::HourNotBookable(23))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_selection_times_out() {
        let conv = conversations(morning());
        conv.begin(1, AccountId::new("mike"));
        conv.begin(2, AccountId::new("zafar"));
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        conv.choose_day(2, date(24)).unwrap();
        tokio::time::advance(Duration::from_secs(6 * 60)).await;

        assert!(matches!(conv.choose_day(1, date(24)), Err(SelectionError::Expired)));
        assert_eq!(conv.purge_expired(), 0);
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        assert_eq!(conv.purge_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_selection() {
        let conv = conversations(morning());
        conv.begin(1, AccountId::new("mike"));
        assert!(conv.cancel(1));
        assert!(!conv.cancel(1));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_surfaces_duplicates() {
        let conv = conversations(morning());
        let store = RequestStore::in_memory();
        let build = || {
            conv.begin(1, AccountId::new("mike"));
            conv.choose_day(1, date(25)).unwrap();
            conv.choose_resource(1, ResourceId(46168)).unwrap();
            conv.choose_hour(1, 18).unwrap()
        };
        let first = build();
        let second = build();

        tokio_test::assert_ok!(conv.submit(&store, first.clone()).await);
        assert!(matches!(
            conv.submit(&store, second).await,
            Err(SelectionError::DuplicateRequest)
        ));
        assert_eq!(store.len(), 1);

        let mine = conv.pending(&store, &AccountId::new("mike")).await.unwrap();
        assert_eq!(mine, vec![first.clone()]);
        assert!(conv.pending(&store, &AccountId::new("zafar")).await.unwrap().is_empty());

        assert!(matches!(
            conv.withdraw(&store, &AccountId::new("zafar"), first.id).await,
            Err(SelectionError::NotFound(_))
        ));
        let withdrawn = conv.withdraw(&store, &AccountId::new("mike"), first.id).await.unwrap();
        assert_eq!(withdrawn.id, first.id);
        assert!(store.is_empty());
    }
}
