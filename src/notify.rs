use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{AccountId, Candidate, ReservationRequest};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Booked {
        request: ReservationRequest,
        slot: Candidate,
    },
    RaceFailed {
        request: ReservationRequest,
        attempts: String,
    },
    SessionFailed {
        reason: String,
    },
    Expired {
        request: ReservationRequest,
    },
    DailyRunComplete {
        opening: DateTime<Utc>,
        booked: usize,
        failed: usize,
        expired: usize,
    },
}

/// A message for one account, or for everyone when `account` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub account: Option<AccountId>,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn to_account(account: AccountId, kind: NotificationKind) -> Self {
        Self {
            account: Some(account),
            kind,
        }
    }

    pub fn broadcast(kind: NotificationKind) -> Self {
        Self { account: None, kind }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NotificationKind::Booked { slot, .. } => write!(f, "Booked {slot}"),
            NotificationKind::RaceFailed { request, attempts } => write!(
                f,
                "Could not book court {} at {}:\n{attempts}",
                request.resource,
                request.target.format("%Y-%m-%d %H:%M")
            ),
            NotificationKind::SessionFailed { reason } => write!(f, "Login failed, nothing booked today: {reason}"),
            NotificationKind::Expired { request } => write!(
                f,
                "Request for court {} at {} expired unbooked",
                request.resource,
                request.target.format("%Y-%m-%d %H:%M")
            ),
            NotificationKind::DailyRunComplete {
                opening,
                booked,
                failed,
                expired,
            } => write!(
                f,
                "Run for {opening} finished: {booked} booked, {failed} failed, {expired} expired"
            ),
        }
    }
}

/// Where outcomes are reported. Delivery is best effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Broadcast hub: one channel per account plus one that sees everything.
pub struct NotifyHub {
    channels: DashMap<AccountId, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notifications for an account. Creates the channel if needed.
    /// Broadcast notifications are delivered here too.
    pub fn subscribe(&self, account: &AccountId) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(account.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        match &notification.account {
            Some(account) => {
                if let Some(sender) = self.channels.get(account) {
                    let _ = sender.send(notification.clone());
                }
            }
            None => {
                for sender in self.channels.iter() {
                    let _ = sender.send(notification.clone());
                }
            }
        }
        let _ = self.all.send(notification.clone());
    }
}

impl Notifier for NotifyHub {
    fn notify(&self, notification: Notification) {
        self.send(&notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_failed(account: &str) -> Notification {
        Notification::to_account(
            AccountId::new(account),
            NotificationKind::SessionFailed {
                reason: "bad password".into(),
            },
        )
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(&AccountId::new("mike"));

        let notification = session_failed("mike");
        hub.send(&notification);

        assert_eq!(rx.recv().await.unwrap(), notification);
    }

    #[tokio::test]
    async fn other_accounts_do_not_see_it() {
        let hub = NotifyHub::new();
        let mut zafar = hub.subscribe(&AccountId::new("zafar"));
        let mut all = hub.subscribe_all();

        hub.send(&session_failed("mike"));

        assert!(zafar.try_recv().is_err());
        assert_eq!(all.recv().await.unwrap().account, Some(AccountId::new("mike")));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_account() {
        let hub = NotifyHub::new();
        let mut mike = hub.subscribe(&AccountId::new("mike"));
        let mut zafar = hub.subscribe(&AccountId::new("zafar"));

        let done = Notification::broadcast(NotificationKind::DailyRunComplete {
            opening: Utc::now(),
            booked: 1,
            failed: 0,
            expired: 2,
        });
        hub.send(&done);

        assert_eq!(mike.recv().await.unwrap(), done);
        assert_eq!(zafar.recv().await.unwrap(), done);
        assert!(done.to_string().contains("1 booked, 0 failed, 2 expired"));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber, should not panic
        hub.notify(session_failed("mike"));
    }
}
