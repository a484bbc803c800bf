//! End-to-end runs of both stages over one in-memory broker.

use faceid_core::crop;
use faceid_core::detector::{DetectedFace, DetectorError};
use faceid_core::recognizer::RecognizerError;
use faceid_core::{BoundingBox, Embedding, FaceDetector, FaceEmbedder, Gallery, GalleryEntry, Outcome};
use faceid_pipeline::{
    Broker, ChannelConfig, Delivery, DetectionOutcome, DetectionStage, IdempotencyGuard,
    IdentificationResult, MemoryBroker, RecognitionStage, Request,
};
use image::{Rgb, Rgb32FImage, RgbImage};
use std::sync::Arc;

const TOPIC: &str = "faceid/requests";
const CROPS: &str = "crops";
const RESPONSES: &str = "responses";

/// Finds a "face" whenever the image is not pure black; the crop keeps the
/// image colour in standardized form.
struct ColorDetector;

impl FaceDetector for ColorDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Option<DetectedFace>, DetectorError> {
        let p = image.get_pixel(0, 0).0;
        if p.iter().all(|&c| c < 10) {
            return Ok(None);
        }
        // One dark corner pixel so min-max scaling keeps the colour ordering.
        let mut face = Rgb32FImage::from_fn(8, 8, |_, _| Rgb(p.map(|c| c as f32 / 128.0)));
        face.put_pixel(7, 7, Rgb([0.0, 0.0, 0.0]));
        Ok(Some(DetectedFace {
            crop: face,
            confidence: 0.9,
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 8.0, height: 8.0, confidence: 0.9 },
        }))
    }
}

/// Embeds a crop as its top-left colour: red-ish → alice, green-ish → bob.
struct ColorEmbedder;

impl FaceEmbedder for ColorEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let [r, g, _] = face.get_pixel(0, 0).0;
        Ok(Embedding::new(vec![r as f32 / 255.0, g as f32 / 255.0]))
    }

    fn dimension(&self) -> usize {
        2
    }
}

struct Pipeline {
    broker: Arc<MemoryBroker>,
    detection: DetectionStage<ColorDetector>,
    recognition: RecognitionStage<ColorEmbedder>,
}

fn pipeline() -> Pipeline {
    let broker = Arc::new(MemoryBroker::new([TOPIC, CROPS, RESPONSES], 3));
    let gallery = Gallery::new(vec![
        GalleryEntry::new("alice", vec![1.0, 0.0]),
        GalleryEntry::new("bob", vec![0.0, 1.0]),
    ])
    .unwrap();
    let channels = ChannelConfig::new(CROPS, RESPONSES);

    let detection = DetectionStage::new(
        ColorDetector,
        Arc::new(IdempotencyGuard::default()),
        broker.clone(),
        channels.clone(),
    );
    let recognition = RecognitionStage::with_max_distance(
        ColorEmbedder,
        None,
        Arc::new(gallery),
        Arc::new(IdempotencyGuard::default()),
        broker.clone(),
        channels,
    )
    .unwrap();

    Pipeline { broker, detection, recognition }
}

fn request(id: &str, color: [u8; 3]) -> Request {
    Request {
        request_id: id.into(),
        filename: format!("{id}.jpg"),
        image_bytes: crop::encode_jpeg(&RgbImage::from_pixel(32, 32, Rgb(color))).unwrap(),
    }
}

fn results(broker: &MemoryBroker) -> Vec<IdentificationResult> {
    broker
        .try_receive_batch(RESPONSES, 100)
        .unwrap()
        .iter()
        .map(|d| IdentificationResult::parse(&d.body).unwrap())
        .collect()
}

#[test]
fn identifies_faces_end_to_end() {
    let mut p = pipeline();
    for (id, color) in [("r1", [250, 10, 10]), ("r2", [10, 250, 10]), ("r3", [0, 0, 0])] {
        p.broker.publish(TOPIC, request(id, color).to_json()).unwrap();
    }

    for delivery in p.broker.try_receive_batch(TOPIC, 10).unwrap() {
        p.detection.handle_message(&delivery.body).unwrap();
    }
    let crops = p.broker.try_receive_batch(CROPS, 10).unwrap();
    assert_eq!(crops.len(), 2);
    let report = p.recognition.handle_batch(&crops).unwrap();
    assert!(report.failures.is_empty());

    let mut got: Vec<_> = results(&p.broker)
        .into_iter()
        .map(|r| (r.request_id, r.outcome))
        .collect();
    got.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        got,
        vec![
            ("r1".to_string(), Outcome::Identity("alice".into())),
            ("r2".to_string(), Outcome::Identity("bob".into())),
            ("r3".to_string(), Outcome::NoFace),
        ]
    );
}

#[test]
fn duplicate_delivery_yields_single_result() {
    let mut p = pipeline();
    let body = request("dup", [250, 10, 10]).to_json();

    // The transport delivers the same request twice.
    assert!(matches!(
        p.detection.handle_message(&body).unwrap(),
        DetectionOutcome::Forwarded { .. }
    ));
    assert_eq!(p.detection.handle_message(&body).unwrap(), DetectionOutcome::Duplicate);

    let crops = p.broker.try_receive_batch(CROPS, 10).unwrap();
    assert_eq!(crops.len(), 1);

    // ...and the crop message is redelivered as well.
    let mut redelivered = crops.clone();
    redelivered.push(crops[0].clone());
    let report = p.recognition.handle_batch(&redelivered).unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(results(&p.broker).len(), 1);
}

#[test]
fn batch_isolates_record_missing_request_id() {
    let mut p = pipeline();
    for (id, color) in [("r1", [250, 10, 10]), ("r3", [10, 250, 10])] {
        p.detection.handle_request(request(id, color)).unwrap();
    }
    let mut crops = p.broker.try_receive_batch(CROPS, 10).unwrap();
    let face = serde_json::from_str::<serde_json::Value>(&crops[0].body).unwrap()["face_image"].clone();
    crops.insert(1, Delivery::new("bad", serde_json::json!({ "face_image": face }).to_string()));

    let report = p.recognition.handle_batch(&crops).unwrap();
    assert_eq!(report.skipped, 1);
    let ids: Vec<_> = report.identified.iter().map(|r| r.request_id.as_str()).collect();
    assert_eq!(ids, vec!["r1", "r3"]);
    assert_eq!(report.identified[0].outcome, Outcome::Identity("alice".into()));
    assert_eq!(report.identified[1].outcome, Outcome::Identity("bob".into()));
}
