//! Recorded detector/tracker output, one JSON object per line:
//!
//! ```text
//! {"ts":"2026-03-01T10:00:00Z","detections":[{"track_id":3,"confidence":0.91,"embedding":[...],"score":0.88}],"retired":[1]}
//! ```
//!
//! A detection carries either a precomputed `embedding` or an `image` path
//! to a crop that is run through the ONNX embedder.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use super::onnx::OnnxFaceEmbedder;
use super::{Extraction, FeatureExtractor, Frame, PipelineStats, StreamPipeline, TrackedDetection};
use crate::identity::{Embedding, TrackId};

#[derive(Debug, Clone, Deserialize)]
pub struct FeedFrame {
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub detections: Vec<FeedDetection>,
    #[serde(default)]
    pub retired: Vec<TrackId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedDetection {
    pub track_id: TrackId,
    pub confidence: f32,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub image: Option<PathBuf>,
    /// Face quality; the detection confidence when absent
    #[serde(default)]
    pub score: Option<f32>,
}

/// The crop payload of a recorded detection
#[derive(Debug, Clone)]
pub struct RecordedCrop {
    pub embedding: Option<Vec<f32>>,
    pub image: Option<PathBuf>,
    pub score: f32,
}

impl FeedFrame {
    pub fn into_frame(self) -> Frame<RecordedCrop> {
        Frame {
            timestamp: self.ts,
            detections: self
                .detections
                .into_iter()
                .map(|d| TrackedDetection {
                    track_id: d.track_id,
                    crop: RecordedCrop {
                        embedding: d.embedding,
                        image: d.image,
                        score: d.score.unwrap_or(d.confidence),
                    },
                    confidence: d.confidence,
                })
                .collect(),
            retired: self.retired,
        }
    }
}

/// Extractor for recorded crops.
///
/// Precomputed vectors are used as-is; image crops need an embedder.
#[derive(Default)]
pub struct FeedExtractor {
    embedder: Option<OnnxFaceEmbedder>,
}

impl FeedExtractor {
    pub fn new(embedder: Option<OnnxFaceEmbedder>) -> Self {
        Self { embedder }
    }
}

impl FeatureExtractor<RecordedCrop> for FeedExtractor {
    fn extract(&self, crop: &RecordedCrop) -> Result<Option<Extraction>> {
        if let Some(values) = &crop.embedding {
            let embedding = Embedding::new(values.clone())?;
            return Ok(Some(Extraction {
                embedding,
                score: crop.score,
            }));
        }

        match (&crop.image, &self.embedder) {
            (Some(path), Some(embedder)) => {
                let img = image::open(path)
                    .with_context(|| format!("loading crop {}", path.display()))?;
                embedder.extract(&img)
            }
            (Some(path), None) => bail!(
                "crop {} needs an image embedder (run replay with --embedder)",
                path.display()
            ),
            (None, _) => Ok(None),
        }
    }
}

/// Iterator over the frames of a feed, skipping blank lines.
pub struct FeedReader<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl<R: BufRead> FeedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl FeedReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening feed {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> Iterator for FeedReader<R> {
    type Item = Result<FeedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let line_no = self.line_no;
            return Some(
                serde_json::from_str(&line).with_context(|| format!("feed line {line_no}")),
            );
        }
    }
}

/// Push every frame of `reader` through `pipeline` in order.
///
/// Malformed lines abort the replay; per-track failures do not.
pub async fn replay<R, X>(
    reader: FeedReader<R>,
    pipeline: &mut StreamPipeline<RecordedCrop, X>,
) -> Result<PipelineStats>
where
    R: BufRead,
    X: FeatureExtractor<RecordedCrop>,
{
    for frame in reader {
        let frame = frame?;
        pipeline.process_frame(frame.into_frame()).await;
    }
    Ok(pipeline.stats())
}
