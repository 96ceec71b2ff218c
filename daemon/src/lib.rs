pub mod analyzer;
pub mod collector;
pub mod config;
pub mod control;
pub mod error;
pub mod foreground;
pub mod manager;
pub mod notifier;
pub mod power;
pub mod protocol;
pub mod record;
pub mod rule;
pub mod socket;
pub mod watchlist;
