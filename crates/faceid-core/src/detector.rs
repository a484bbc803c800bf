//! Face detection collaborator.
//!
//! [`FaceDetector`] is the seam the detection stage depends on. The shipped
//! implementation is SCRFD (Sample and Computation Redistribution for
//! Efficient Face Detection) via ONNX Runtime, with 3-stride anchor decoding
//! and NMS post-processing. Only the single most confident face is returned.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, Rgb32FImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Side length of the square face crop handed to the recognition stage.
pub const CROP_SIZE: u32 = 160;
const CROP_MEAN: f32 = 127.5;
const CROP_STD: f32 = 128.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face found by the detector.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Standardized float crop; values are not confined to any fixed range.
    pub crop: Rgb32FImage,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Locates and crops the single most prominent face in an image.
pub trait FaceDetector {
    /// Returns `Ok(None)` when no face is present. `Err` means the model
    /// itself failed and the request may be retried.
    fn detect(&mut self, image: &RgbImage) -> Result<Option<DetectedFace>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        tracing::info!(
            path = model_path,
            outputs = num_outputs,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        Ok(Self { session })
    }

    /// Run the network and return all faces above threshold, best first.
    fn detect_all(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        // Positional layout: [0-2] scores, [3-5] bboxes, per stride 8/16/32.
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[pos]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[pos + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            detections.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Option<DetectedFace>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(None);
        }
        let faces = self.detect_all(image)?;
        let Some(best) = faces.first().copied() else {
            tracing::debug!("no face detected");
            return Ok(None);
        };
        tracing::debug!(confidence = best.confidence, faces = faces.len(), "face detected");

        Ok(Some(DetectedFace {
            crop: crop_face(image, &best),
            confidence: best.confidence,
            bbox: best,
        }))
    }
}

/// Letterbox an RGB image into the SCRFD input square and build a NCHW tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let size = SCRFD_INPUT_SIZE;
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding is zero after normalization, i.e. the mean pixel value.
    let n = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    let (ox, oy) = (pad_x.floor() as usize, pad_y.floor() as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + ox, y as usize + oy);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Decode detections for a single stride level back to source coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..num_anchors)
        .filter_map(|idx| {
            let score = scores.get(idx).copied().unwrap_or(0.0);
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * s;
            let cy = (cell / grid) as f32 * s;

            let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
            let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;
            let x1 = unmap_x(cx - offsets[0] * s);
            let y1 = unmap_y(cy - offsets[1] * s);
            let x2 = unmap_x(cx + offsets[2] * s);
            let y2 = unmap_y(cy + offsets[3] * s);

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// Cut the face box out of the source image, resize to [`CROP_SIZE`], and
/// standardize each channel as `(p - 127.5) / 128`.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> Rgb32FImage {
    let (width, height) = image.dimensions();
    let x0 = (face.x.max(0.0) as u32).min(width.saturating_sub(1));
    let y0 = (face.y.max(0.0) as u32).min(height.saturating_sub(1));
    let x1 = ((face.x + face.width).ceil().max(0.0) as u32).clamp(x0 + 1, width);
    let y1 = ((face.y + face.height).ceil().max(0.0) as u32).clamp(y0 + 1, height);

    let region = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    let resized = imageops::resize(&region, CROP_SIZE, CROP_SIZE, FilterType::Triangle);

    Rgb32FImage::from_fn(CROP_SIZE, CROP_SIZE, |x, y| {
        let p = resized.get_pixel(x, y);
        Rgb(p.0.map(|v| (v as f32 - CROP_MEAN) / CROP_STD))
    })
}
