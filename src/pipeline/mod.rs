//! Per-stream processing of tracked detections.
//!
//! Each video stream owns one [`StreamPipeline`]. Frames are processed in
//! arrival order; extraction and resolution run on the blocking pool under a
//! timeout so a stuck model or database never stalls the stream.

pub mod feed;
pub mod onnx;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::DropReason;
use crate::identity::{Embedding, Resolution, Resolver, SampleBuffer, TrackId};

/// A usable face found in a crop
#[derive(Debug, Clone)]
pub struct Extraction {
    pub embedding: Embedding,
    /// Quality of the face, used to pick the best sample per track
    pub score: f32,
}

/// Turns a detection crop into an embedding.
///
/// `Ok(None)` means the crop holds no usable face; the detection is skipped
/// without touching the track's buffer entry.
pub trait FeatureExtractor<C>: Send + Sync + 'static {
    fn extract(&self, crop: &C) -> anyhow::Result<Option<Extraction>>;
}

#[derive(Debug, Clone)]
pub struct TrackedDetection<C> {
    pub track_id: TrackId,
    pub crop: C,
    /// Person-detector confidence
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct Frame<C> {
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<TrackedDetection<C>>,
    /// Tracks the tracker has stopped following
    pub retired: Vec<TrackId>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub min_confidence: f32,
    pub observe: chrono::Duration,
    pub idle_eviction: chrono::Duration,
    pub extract_timeout: Duration,
    pub resolve_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_confidence: config.detection.min_confidence,
            observe: config.buffer.observe_window(),
            idle_eviction: config.buffer.idle_eviction(),
            extract_timeout: config.pipeline.extract_timeout(),
            resolve_timeout: config.pipeline.resolve_timeout(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames: u64,
    pub detections: u64,
    /// Below the detector confidence floor
    pub low_confidence: u64,
    /// Extractor found no usable face
    pub no_face: u64,
    /// Samples emitted by the buffer
    pub emitted: u64,
    pub resolved: u64,
    /// New identities plus re-entries
    pub unique: u64,
    pub dropped: u64,
    /// Buffer entries removed by retirement or the idle sweep
    pub evicted: u64,
}

impl PipelineStats {
    pub fn merge(&mut self, other: &PipelineStats) {
        self.frames += other.frames;
        self.detections += other.detections;
        self.low_confidence += other.low_confidence;
        self.no_face += other.no_face;
        self.emitted += other.emitted;
        self.resolved += other.resolved;
        self.unique += other.unique;
        self.dropped += other.dropped;
        self.evicted += other.evicted;
    }
}

#[derive(Debug)]
pub enum TrackEvent {
    Resolved {
        track_id: TrackId,
        resolution: Resolution,
    },
    Dropped {
        track_id: TrackId,
        reason: DropReason,
    },
}

pub struct StreamPipeline<C, X> {
    name: String,
    extractor: Arc<X>,
    resolver: Arc<Resolver>,
    buffer: SampleBuffer<Embedding>,
    settings: PipelineSettings,
    stats: PipelineStats,
    _crop: PhantomData<fn(C)>,
}

impl<C, X> StreamPipeline<C, X>
where
    C: Send + 'static,
    X: FeatureExtractor<C>,
{
    pub fn new(
        name: impl Into<String>,
        extractor: Arc<X>,
        resolver: Arc<Resolver>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            name: name.into(),
            extractor,
            resolver,
            buffer: SampleBuffer::new(settings.observe),
            settings,
            stats: PipelineStats::default(),
            _crop: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn buffered_tracks(&self) -> usize {
        self.buffer.len()
    }

    /// Process one frame and return what happened to each emitting track.
    ///
    /// A failing track never stops the rest of the frame.
    pub async fn process_frame(&mut self, frame: Frame<C>) -> Vec<TrackEvent> {
        self.stats.frames += 1;
        let now = frame.timestamp;

        let mut events = Vec::new();
        for detection in frame.detections {
            self.stats.detections += 1;
            if let Some(event) = self.process_detection(detection, now).await {
                events.push(event);
            }
        }

        for track_id in &frame.retired {
            if self.buffer.retire(track_id) {
                self.stats.evicted += 1;
                trace!(stream = %self.name, track_id = %track_id, "Retired track");
            }
        }
        let idle = self.buffer.evict_idle(now, self.settings.idle_eviction);
        if idle > 0 {
            self.stats.evicted += idle as u64;
            debug!(stream = %self.name, count = idle, "Evicted idle tracks");
        }

        events
    }

    async fn process_detection(
        &mut self,
        detection: TrackedDetection<C>,
        now: DateTime<Utc>,
    ) -> Option<TrackEvent> {
        let TrackedDetection {
            track_id,
            crop,
            confidence,
        } = detection;

        // NaN confidences fail this comparison too
        if !(confidence >= self.settings.min_confidence) {
            self.stats.low_confidence += 1;
            return None;
        }
        if self.buffer.touch(&track_id, now) {
            return None;
        }

        let extraction = match self.extract(crop).await {
            Ok(Some(extraction)) => extraction,
            Ok(None) => {
                self.stats.no_face += 1;
                return None;
            }
            Err(reason) => return Some(self.drop_event(track_id, reason)),
        };

        let sample = self
            .buffer
            .update(track_id.clone(), extraction.embedding, extraction.score, now)?;
        self.stats.emitted += 1;

        match self.resolve(sample, now).await {
            Ok(resolution) => {
                self.stats.resolved += 1;
                if resolution.outcome.is_unique() {
                    self.stats.unique += 1;
                }
                info!(
                    stream = %self.name,
                    track_id = %track_id,
                    identity_id = resolution.outcome.identity_id(),
                    similarity = ?resolution.similarity,
                    unique = resolution.outcome.is_unique(),
                    "Resolved track"
                );
                Some(TrackEvent::Resolved { track_id, resolution })
            }
            Err(reason) => Some(self.drop_event(track_id, reason)),
        }
    }

    fn drop_event(&mut self, track_id: TrackId, reason: DropReason) -> TrackEvent {
        self.buffer.release(&track_id);
        self.stats.dropped += 1;
        warn!(stream = %self.name, track_id = %track_id, reason = %reason, "Dropped event");
        TrackEvent::Dropped { track_id, reason }
    }

    async fn extract(&self, crop: C) -> Result<Option<Extraction>, DropReason> {
        let extractor = Arc::clone(&self.extractor);
        let task = tokio::task::spawn_blocking(move || extractor.extract(&crop));

        match tokio::time::timeout(self.settings.extract_timeout, task).await {
            Err(_) => Err(DropReason::ExtractionTimeout),
            Ok(Err(join_err)) => Err(DropReason::ExtractionFailed(join_err.to_string())),
            Ok(Ok(Err(err))) => Err(DropReason::ExtractionFailed(format!("{err:#}"))),
            Ok(Ok(Ok(extraction))) => Ok(extraction),
        }
    }

    async fn resolve(&self, embedding: Embedding, now: DateTime<Utc>) -> Result<Resolution, DropReason> {
        let resolver = Arc::clone(&self.resolver);
        let cancel = Arc::new(AtomicBool::new(false));
        let task_cancel = Arc::clone(&cancel);
        let task = tokio::task::spawn_blocking(move || {
            resolver.resolve_cancellable(&embedding, now, &task_cancel)
        });

        match tokio::time::timeout(self.settings.resolve_timeout, task).await {
            Err(_) => {
                cancel.store(true, Ordering::Release);
                Err(DropReason::ResolveTimeout)
            }
            Ok(Err(join_err)) => Err(DropReason::ResolveTaskFailed(join_err.to_string())),
            Ok(Ok(result)) => result.map_err(DropReason::from),
        }
    }
}
