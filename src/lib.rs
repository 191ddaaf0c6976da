//! RentChat sync library.
//!
//! Client-side realtime sync for conversations and notifications: message
//! threads, the inbox index and the notification bell, kept consistent
//! across paginated history loads and per-surface push sessions.

pub mod api;
pub mod channel;
pub mod config;
pub mod conversation_index;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod logging;
pub mod message_store;
pub mod model;
pub mod notifications;
pub mod protocol;
pub mod read_tracker;
pub mod state;
pub mod validation;

pub use engine::{LoadOutcome, SyncEngine};

#[cfg(test)]
mod test_support;
