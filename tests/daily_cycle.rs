use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use courtbot::catalog::{Catalog, OpeningSchedule};
use courtbot::clock::{AnchoredClock, Clock};
use courtbot::dispatcher::RequestDispatcher;
use courtbot::engine::RaceExecutor;
use courtbot::ledger::LedgerClient;
use courtbot::model::{AccountId, ReservationRequest, ResourceId};
use courtbot::notify::{NotificationKind, NotifyHub};
use courtbot::store::{RequestStore, Store};
use courtbot::trigger::DailyTrigger;

// ── Test infrastructure ──────────────────────────────────────

fn test_wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("courtbot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("requests.wal")
}

fn at(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, d, h, 0, 0).unwrap()
}

fn request(account: &str, day: u32, hour: u32, court: u32) -> ReservationRequest {
    ReservationRequest::new(
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 5, day, hour, 0, 0)
            .unwrap(),
        ResourceId(court),
        AccountId::new(account),
        at(20, 9),
    )
}

struct Harness {
    store: Arc<RequestStore>,
    ledger: Arc<LedgerClient>,
    hub: Arc<NotifyHub>,
    trigger: DailyTrigger,
}

fn harness(now: DateTime<Utc>, path: &PathBuf) -> Harness {
    let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::starting_at(now));
    let schedule = OpeningSchedule::default();
    let store = Arc::new(RequestStore::open(path, 1000).unwrap());
    let ledger = Arc::new(LedgerClient::new(clock.clone(), Duration::from_secs(4 * 24 * 3600)));
    let hub = Arc::new(NotifyHub::new());
    let executor = Arc::new(
        RaceExecutor::new(ledger.clone(), clock.clone()).with_late_tolerance(schedule.safety_margin),
    );
    let dispatcher = RequestDispatcher::new(
        store.clone(),
        ledger.clone(),
        hub.clone(),
        Arc::new(Catalog::default()),
        executor,
        schedule.slot,
    );
    let trigger = DailyTrigger::new(schedule, clock, store.clone(), dispatcher, hub.clone());
    Harness {
        store,
        ledger,
        hub,
        trigger,
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn daily_run_books_expires_and_keeps_failures() {
    let path = test_wal_path();
    let mut h = harness(at(22, 8), &path);

    let booked = request("mike", 24, 10, 46166);
    let fallback = request("zafar", 24, 18, 46164);
    let stale = request("mike", 21, 9, 46168);
    let hopeless = request("anna", 24, 12, 46168);
    let later = request("anna", 25, 12, 46168);
    for r in [&booked, &fallback, &stale, &hopeless, &later] {
        assert!(h.store.add(r.clone()).await.unwrap());
    }
    // someone else already holds 18:00 on court 46164, and every option for anna
    let hour = chrono::Duration::hours(1);
    h.ledger.occupy(at(24, 18), at(24, 18) + hour, ResourceId(46164));
    for (start, court) in [(12, 46168), (12, 46169), (13, 46168), (13, 46169)] {
        h.ledger.occupy(at(24, start), at(24, start) + hour, ResourceId(court));
    }

    let report = h.trigger.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.opening, at(22, 11));
    assert_eq!(report.expired, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.dispatch.booked, 2);
    assert_eq!(report.dispatch.failed, 1);

    let mut ours: Vec<(DateTime<Utc>, u32, String)> = h
        .ledger
        .bookings()
        .into_iter()
        .filter(|b| b.reference != "external")
        .map(|b| (b.start, b.resource.0, b.account.to_string()))
        .collect();
    ours.sort();
    assert_eq!(
        ours,
        vec![
            (at(24, 10), 46166, "mike".to_string()),
            (at(24, 18), 46165, "zafar".to_string()),
        ]
    );

    let mut left: Vec<Ulid> = h.store.snapshot().into_iter().map(|r| r.id).collect();
    left.sort();
    let mut expected = vec![hopeless.id, later.id];
    expected.sort();
    assert_eq!(left, expected);

    // the same state comes back from the log
    drop(h);
    let reopened = RequestStore::open(&path, 1000).unwrap();
    let mut replayed: Vec<Ulid> = reopened.list_pending().await.unwrap().into_iter().map(|r| r.id).collect();
    replayed.sort();
    assert_eq!(replayed, expected);
}

#[tokio::test(start_paused = true)]
async fn trigger_runs_every_day_until_shutdown() {
    let path = test_wal_path();
    let h = harness(at(22, 8), &path);
    h.store.add(request("mike", 24, 10, 46166)).await.unwrap();
    h.store.add(request("mike", 25, 19, 46164)).await.unwrap();

    let mut all = h.hub.subscribe_all();
    let token = CancellationToken::new();
    let task = tokio::spawn(h.trigger.run(token.clone()));

    let mut runs = Vec::new();
    while runs.len() < 2 {
        if let NotificationKind::DailyRunComplete { opening, booked, .. } = all.recv().await.unwrap().kind {
            runs.push((opening, booked));
        }
    }
    token.cancel();
    task.await.unwrap();

    assert_eq!(runs, vec![(at(22, 11), 1), (at(23, 11), 1)]);
    assert!(h.store.is_empty());
    assert_eq!(h.ledger.logins(), 1);
}
