pub mod catalog;
pub mod client;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod engine;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod trigger;
pub mod wal;
