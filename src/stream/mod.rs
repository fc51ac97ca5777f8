//! Session status streaming.
//!
//! One authenticated viewer per connection receives a session-scoped
//! event feed: an initial snapshot, committed status changes, periodic
//! heartbeats, and an in-band terminal event on close. Admission is
//! gated twice: a cheap pre-auth rate limiter, then full capability
//! verification plus per-owner and global concurrency caps.

pub mod admission;
pub mod broadcaster;
pub mod connection;
pub mod rate_limit;

pub use admission::{
    admit, AdmissionControl, AdmissionError, AdmissionTicket, InMemoryAdmission, RedisAdmission,
};
pub use broadcaster::{CloseReason, StatusBroadcaster, StreamEvent};
pub use connection::{run_stream, EventSink, SinkClosed, StreamConfig};
pub use rate_limit::StreamRateLimiter;
