//! Face embedding with ONNX Runtime.
//!
//! UltraFace finds the face inside a person crop and ArcFace turns it into a
//! 512-dim embedding. The UltraFace confidence of the chosen face becomes the
//! sample score used by the buffer.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use super::{Extraction, FeatureExtractor};
use crate::config::EmbedderConfig;
use crate::identity::Embedding;

const DETECT_WIDTH: u32 = 320;
const DETECT_HEIGHT: u32 = 240;
const DETECT_THRESHOLD: f32 = 0.7;
const ARCFACE_SIZE: u32 = 112;
/// Padding added around the detected face, as a fraction of its size
const FACE_PADDING: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
struct FaceBox {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

pub struct OnnxFaceEmbedder {
    detector: Mutex<Session>,
    embedder: Mutex<Session>,
}

impl OnnxFaceEmbedder {
    pub fn open(config: &EmbedderConfig) -> Result<Self> {
        let detector = load_session(&config.detection_model, config.intra_threads)?;
        let embedder = load_session(&config.embedding_model, config.intra_threads)?;
        tracing::info!(
            detection = ?config.detection_model,
            embedding = ?config.embedding_model,
            "Loaded face models"
        );
        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
        })
    }
}

impl FeatureExtractor<DynamicImage> for OnnxFaceEmbedder {
    fn extract(&self, crop: &DynamicImage) -> Result<Option<Extraction>> {
        let faces = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;
            run_ultraface(&mut detector, crop)?
        };

        let Some((face, confidence)) = best_face(faces) else {
            return Ok(None);
        };

        let (width, height) = crop.dimensions();
        let face_img = crop_face(crop, &face, width, height);

        let values = {
            let mut embedder = self
                .embedder
                .lock()
                .map_err(|e| anyhow!("Failed to lock embedding model: {}", e))?;
            run_arcface(&mut embedder, &face_img)?
        };

        let embedding = Embedding::new(values)?;
        Ok(Some(Extraction {
            embedding,
            score: confidence,
        }))
    }
}

fn load_session(path: &Path, intra_threads: usize) -> Result<Session> {
    if !path.exists() {
        return Err(anyhow!("Model file not found: {}", path.display()));
    }
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(ort::Error::<()>::from)?
        .with_intra_threads(intra_threads)
        .map_err(ort::Error::<()>::from)?
        .commit_from_file(path)
        .map_err(|e| anyhow!("Failed to load model {}: {}", path.display(), e))?;
    Ok(session)
}

/// Pack an RGB image into a normalized NCHW buffer.
fn to_nchw(img: &DynamicImage, width: u32, height: u32, mean: f32, scale: f32) -> Vec<f32> {
    let resized = img.resize_exact(width, height, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * width as usize + x as usize;
        for c in 0..3 {
            data[c * plane + idx] = (pixel[c] as f32 - mean) / scale;
        }
    }
    data
}

/// Run UltraFace and return every face above the detection threshold.
fn run_ultraface(session: &mut Session, img: &DynamicImage) -> Result<Vec<(FaceBox, f32)>> {
    let (orig_width, orig_height) = img.dimensions();

    let input = to_nchw(img, DETECT_WIDTH, DETECT_HEIGHT, 127.0, 128.0);
    let input_tensor = Tensor::from_array((
        [1usize, 3, DETECT_HEIGHT as usize, DETECT_WIDTH as usize],
        input.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores").ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes").ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized corners
    let num_anchors = scores_shape[1] as usize;
    let mut faces = Vec::new();
    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= DETECT_THRESHOLD {
            continue;
        }
        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        faces.push((
            FaceBox {
                x: x1.max(0),
                y: y1.max(0),
                width: (x2 - x1).max(1),
                height: (y2 - y1).max(1),
            },
            confidence,
        ));
    }
    Ok(faces)
}

/// A person crop holds one face; the most confident box wins.
fn best_face(faces: Vec<(FaceBox, f32)>) -> Option<(FaceBox, f32)> {
    faces
        .into_iter()
        .filter(|(face, _)| face.width > 0 && face.height > 0)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Crop the face with padding, clamped to the image.
fn crop_face(img: &DynamicImage, face: &FaceBox, img_width: u32, img_height: u32) -> DynamicImage {
    let padding_x = (face.width as f32 * FACE_PADDING) as i32;
    let padding_y = (face.height as f32 * FACE_PADDING) as i32;

    let x = ((face.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((face.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((face.width + padding_x * 2) as u32).min(img_width - x);
    let h = ((face.height + padding_y * 2) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

fn run_arcface(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    let input = to_nchw(face_img, ARCFACE_SIZE, ARCFACE_SIZE, 127.5, 127.5);
    let input_tensor = Tensor::from_array((
        [1usize, 3, ARCFACE_SIZE as usize, ARCFACE_SIZE as usize],
        input.into_boxed_slice(),
    ))?;

    // ArcFace exports name their input "data"
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let (_name, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, data) = output.try_extract_tensor::<f32>()?;
    Ok(data.to_vec())
}
