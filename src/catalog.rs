use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::model::{ReservationRequest, ResourceId};

/// A bookable court.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub label: String,
    /// Courts sharing a class are interchangeable (the two halves of a split court,
    /// the two courts of a pair).
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    resources: Vec<Resource>,
}

impl Default for Catalog {
    fn default() -> Self {
        let court = |id, label: &str, class: &str| Resource {
            id: ResourceId(id),
            label: label.to_string(),
            class: class.to_string(),
        };
        Self {
            resources: vec![
                court(46164, "Hard - Tennis Court #1", "tennis"),
                court(46165, "Hard - Tennis Court #2", "tennis"),
                court(46166, "Pickleball - Pickleball 1A", "pickleball-1"),
                court(46167, "Pickleball - Pickleball 1B", "pickleball-1"),
                court(46168, "Pickleball - Pickleball 2A", "pickleball-2"),
                court(46169, "Pickleball - Pickleball 2B", "pickleball-2"),
            ],
        }
    }
}

impl Catalog {
    pub fn new(resources: Vec<Resource>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for r in &resources {
            if !seen.insert(r.id) {
                return Err(ConfigError::Catalog(format!("duplicate court id {}", r.id)));
            }
        }
        Ok(Self { resources })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let parsed: Catalog =
            serde_json::from_str(json).map_err(|e| ConfigError::Catalog(e.to_string()))?;
        Self::new(parsed.resources)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Catalog(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn get(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// First other court of the same class, in catalog order.
    pub fn alternate_for(&self, id: ResourceId) -> Option<&Resource> {
        let class = &self.get(id)?.class;
        self.resources
            .iter()
            .find(|r| r.id != id && &r.class == class)
    }
}

/// When and how far ahead the provider opens slots.
#[derive(Debug, Clone)]
pub struct OpeningSchedule {
    /// Zone in which the opening hour and calendar dates are read.
    pub zone: FixedOffset,
    pub opening_hour: u32,
    /// How long before the opening instant the trigger wakes.
    pub safety_margin: Duration,
    /// Slots open this many days before their date.
    pub horizon_days: i64,
    pub slot: chrono::Duration,
    pub first_slot_hour: u32,
    pub last_slot_hour: u32,
}

impl Default for OpeningSchedule {
    fn default() -> Self {
        Self {
            zone: Utc.fix(),
            opening_hour: 11,
            safety_margin: Duration::from_secs(30),
            horizon_days: 2,
            slot: chrono::Duration::hours(1),
            first_slot_hour: 7,
            last_slot_hour: 21,
        }
    }
}

impl OpeningSchedule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.opening_hour > 23 {
            return Err(ConfigError::Invalid {
                var: "COURTBOT_OPENING_HOUR",
                reason: format!("{} is not an hour of the day", self.opening_hour),
            });
        }
        if self.horizon_days < 0 {
            return Err(ConfigError::Invalid {
                var: "COURTBOT_HORIZON_DAYS",
                reason: "must not be negative".into(),
            });
        }
        if self.slot <= chrono::Duration::zero() {
            return Err(ConfigError::Invalid {
                var: "COURTBOT_SLOT_MINUTES",
                reason: "must be positive".into(),
            });
        }
        if self.first_slot_hour > self.last_slot_hour || self.last_slot_hour > 23 {
            return Err(ConfigError::Invalid {
                var: "slot hours",
                reason: format!("{}..={}", self.first_slot_hour, self.last_slot_hour),
            });
        }
        Ok(())
    }

    fn local(&self, naive: NaiveDateTime) -> DateTime<FixedOffset> {
        let utc = naive - chrono::Duration::seconds(i64::from(self.zone.local_minus_utc()));
        self.zone.from_utc_datetime(&utc)
    }

    /// Calendar date of `now` in the schedule's zone.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.zone).date_naive()
    }

    pub fn opening_on(&self, date: NaiveDate) -> DateTime<Utc> {
        let time = NaiveTime::from_hms_opt(self.opening_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        self.local(date.and_time(time)).with_timezone(&Utc)
    }

    /// Today's opening instant if it is still ahead of `now`, otherwise tomorrow's.
    pub fn next_opening(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = self.today(now);
        let opening = self.opening_on(today);
        if now < opening {
            opening
        } else {
            self.opening_on(today + chrono::Duration::days(1))
        }
    }

    /// When the trigger should wake for `opening`.
    pub fn arm_at(&self, opening: DateTime<Utc>) -> DateTime<Utc> {
        opening - chrono::Duration::from_std(self.safety_margin).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// The only slot date that opens at `opening`.
    pub fn eligible_date(&self, opening: DateTime<Utc>) -> NaiveDate {
        self.today(opening) + chrono::Duration::days(self.horizon_days)
    }

    /// Requests on or before the opening day can no longer be claimed.
    pub fn is_expired(&self, request: &ReservationRequest, opening: DateTime<Utc>) -> bool {
        request.target_date_in(&self.zone) <= self.today(opening)
    }

    pub fn is_eligible(&self, request: &ReservationRequest, opening: DateTime<Utc>) -> bool {
        request.target_date_in(&self.zone) == self.eligible_date(opening)
    }

    /// Dates a user may queue a request for right now.
    ///
    /// Before today's opening, today+horizon can still be claimed at that opening;
    /// after it, that date has already been raced.
    pub fn bookable_days(&self, now: DateTime<Utc>) -> Vec<NaiveDate> {
        let today = self.today(now);
        let first = if now < self.opening_on(today) { 0 } else { 1 };
        (first..3)
            .map(|extra| today + chrono::Duration::days(self.horizon_days + extra))
            .collect()
    }

    pub fn bookable_hours(&self) -> Vec<u32> {
        (self.first_slot_hour..=self.last_slot_hour).collect()
    }

    /// Slot start for `date` at `hour` in the schedule's zone, if `hour` is bookable.
    pub fn slot_start(&self, date: NaiveDate, hour: u32) -> Option<DateTime<FixedOffset>> {
        if !(self.first_slot_hour..=self.last_slot_hour).contains(&hour) {
            return None;
        }
        let time = NaiveTime::from_hms_opt(hour, 0, 0)?;
        Some(self.local(date.and_time(time)))
    }
}
