//! Inbound motion sample feed.
//!
//! This module defines the sample schema delivered by the external
//! motion-ingestion collaborator and a line-oriented JSON reader for it.

pub mod jsonl;
pub mod types;

// Re-export commonly used types
pub use jsonl::{FeedItem, JsonlFeed};
pub use types::{Activity, MotionSample, Zone};
