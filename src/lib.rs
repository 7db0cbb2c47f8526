//! Visitor identity resolution and footfall analytics.
//!
//! Tracked person detections from a camera feed are buffered per track,
//! embedded, matched against known identities and folded into visits and
//! per-day totals.

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod identity;
pub mod logging;
pub mod pipeline;
