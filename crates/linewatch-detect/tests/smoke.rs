use image::RgbImage;
use linewatch_detect::{
    decode_raw_output, non_max_suppression, remap_detections, DetectError, Detection,
    CONF_THRESHOLD, IOU_THRESHOLD,
};
use linewatch_preprocess::{Letterbox, LetterboxPlan};
use ndarray::{Array2, Array3, ArrayD};

/// Raw tensor with two classes and four anchors; only the first two anchors
/// clear the 0.25 threshold. Coordinates are in pixels (values above 1.0).
fn sample_raw() -> Array2<f32> {
    // rows: cx, cy, w, h, class0, class1
    let mut raw = Array2::<f32>::zeros((6, 4));
    // anchor 0: 100x100 box at (320, 320), class1 at 0.9
    raw[[0, 0]] = 320.0;
    raw[[1, 0]] = 320.0;
    raw[[2, 0]] = 100.0;
    raw[[3, 0]] = 100.0;
    raw[[4, 0]] = 0.10;
    raw[[5, 0]] = 0.90;
    // anchor 1: 50x80 box at (100, 150), class0 at 0.30
    raw[[0, 1]] = 100.0;
    raw[[1, 1]] = 150.0;
    raw[[2, 1]] = 50.0;
    raw[[3, 1]] = 80.0;
    raw[[4, 1]] = 0.30;
    raw[[5, 1]] = 0.05;
    // anchor 2: exactly at the threshold, must be dropped
    raw[[0, 2]] = 200.0;
    raw[[1, 2]] = 200.0;
    raw[[2, 2]] = 40.0;
    raw[[3, 2]] = 40.0;
    raw[[4, 2]] = 0.25;
    // anchor 3: far below
    raw[[0, 3]] = 50.0;
    raw[[1, 3]] = 50.0;
    raw[[2, 3]] = 20.0;
    raw[[3, 3]] = 20.0;
    raw[[5, 3]] = 0.01;
    raw
}

#[test]
fn decode_thresholds_and_converts_to_corners() {
    let dets = decode_raw_output(sample_raw().into_dyn().view(), (640, 640)).unwrap();
    assert_eq!(dets.len(), 2);

    assert_eq!(dets[0].class, 1);
    assert!((dets[0].score - 0.9).abs() < 1e-6);
    assert_eq!(dets[0].bbox, [270.0, 270.0, 370.0, 370.0]);

    assert_eq!(dets[1].class, 0);
    assert_eq!(dets[1].bbox, [75.0, 110.0, 125.0, 190.0]);
}

#[test]
fn decode_treats_small_magnitudes_as_normalized() {
    let pixel = decode_raw_output(sample_raw().into_dyn().view(), (640, 640)).unwrap();

    let normalized = sample_raw().mapv(|v| if v > 1.0 { v / 640.0 } else { v });
    let scaled = decode_raw_output(normalized.into_dyn().view(), (640, 640)).unwrap();

    assert_eq!(pixel.len(), scaled.len());
    for (a, b) in pixel.iter().zip(&scaled) {
        for i in 0..4 {
            assert!((a.bbox[i] - b.bbox[i]).abs() < 1e-2, "{:?} vs {:?}", a, b);
        }
    }
}

#[test]
fn decode_squeezes_leading_batch_axis() {
    let raw = sample_raw();
    let batched = raw.clone().insert_axis(ndarray::Axis(0));
    assert_eq!(batched.shape(), &[1, 6, 4]);

    let flat = decode_raw_output(raw.into_dyn().view(), (640, 640)).unwrap();
    let squeezed = decode_raw_output(batched.into_dyn().view(), (640, 640)).unwrap();
    assert_eq!(flat, squeezed);
}

#[test]
fn decode_rejects_malformed_shapes() {
    // too few feature rows to carry a class score
    let thin = Array2::<f32>::zeros((4, 10));
    assert!(matches!(
        decode_raw_output(thin.into_dyn().view(), (640, 640)),
        Err(DetectError::BadOutputShape(_))
    ));

    // batch axis bigger than one
    let multi = Array3::<f32>::zeros((2, 6, 10));
    assert!(matches!(
        decode_raw_output(multi.into_dyn().view(), (640, 640)),
        Err(DetectError::BadOutputShape(_))
    ));

    // 1-d tensor
    let flat = ArrayD::<f32>::zeros(ndarray::IxDyn(&[24]));
    assert!(decode_raw_output(flat.view(), (640, 640)).is_err());
}

#[test]
fn decode_drops_nan_scores() {
    let mut raw = sample_raw();
    raw[[5, 0]] = f32::NAN;
    let dets = decode_raw_output(raw.into_dyn().view(), (640, 640)).unwrap();
    // anchor 0's only strong score became NaN, leaving just anchor 1
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].class, 0);
}

fn det(bbox: [f32; 4], score: f32) -> Detection {
    Detection {
        bbox,
        score,
        class: 0,
    }
}

#[test]
fn nms_keeps_the_stronger_of_two_overlapping_boxes() {
    // ~0.9 IoU pair plus one distant box
    let dets = vec![
        det([100.0, 100.0, 200.0, 200.0], 0.6),
        det([102.0, 100.0, 202.0, 200.0], 0.9),
        det([400.0, 400.0, 500.0, 500.0], 0.5),
    ];
    let kept = non_max_suppression(dets, IOU_THRESHOLD);
    assert_eq!(kept.len(), 2);
    assert!((kept[0].score - 0.9).abs() < 1e-6);
    assert!((kept[1].score - 0.5).abs() < 1e-6);
}

#[test]
fn nms_is_idempotent() {
    let dets = vec![
        det([0.0, 0.0, 50.0, 50.0], 0.8),
        det([10.0, 10.0, 60.0, 60.0], 0.7),
        det([200.0, 200.0, 260.0, 260.0], 0.9),
        det([205.0, 205.0, 265.0, 265.0], 0.85),
    ];
    let once = non_max_suppression(dets, IOU_THRESHOLD);
    let twice = non_max_suppression(once.clone(), IOU_THRESHOLD);
    assert_eq!(once, twice);
}

#[test]
fn nms_survives_empty_and_nan_input() {
    assert!(non_max_suppression(Vec::new(), IOU_THRESHOLD).is_empty());

    let dets = vec![
        det([0.0, 0.0, 50.0, 50.0], f32::NAN),
        det([0.0, 0.0, 50.0, 50.0], 0.9),
    ];
    let kept = non_max_suppression(dets, IOU_THRESHOLD);
    assert_eq!(kept.len(), 1);
    assert!((kept[0].score - 0.9).abs() < 1e-6);
}

#[test]
fn remap_inverts_the_letterbox() {
    // 1280x960 photo into a 640 canvas: scale 0.5, 80px bars top and bottom
    let plan = LetterboxPlan {
        scale: 0.5,
        pad: (0, 80, 0, 80),
        orig: (1280, 960),
    };
    let dets = vec![det([100.0, 180.0, 300.0, 380.0], 0.9)];
    let out = remap_detections(dets, &plan);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].bbox, [200.0, 200.0, 600.0, 600.0]);
}

#[test]
fn remap_discards_boxes_in_the_padding() {
    let plan = LetterboxPlan {
        scale: 0.5,
        pad: (0, 80, 0, 80),
        orig: (1280, 960),
    };
    // entirely inside the top bar
    let dets = vec![det([10.0, 10.0, 50.0, 70.0], 0.9)];
    assert!(remap_detections(dets, &plan).is_empty());
}

#[test]
fn remap_discards_tiny_boxes() {
    let plan = LetterboxPlan {
        scale: 0.5,
        pad: (0, 80, 0, 80),
        orig: (1280, 960),
    };
    // 2px wide on the canvas → 4px in the photo, below the 5px minimum
    let dets = vec![det([100.0, 100.0, 102.0, 300.0], 0.9)];
    assert!(remap_detections(dets, &plan).is_empty());
}

#[test]
fn remap_clamps_overhanging_boxes() {
    let plan = LetterboxPlan {
        scale: 0.5,
        pad: (0, 80, 0, 80),
        orig: (1280, 960),
    };
    // spills past the right edge of the content region
    let dets = vec![det([600.0, 100.0, 700.0, 300.0], 0.9)];
    let out = remap_detections(dets, &plan);
    assert_eq!(out.len(), 1);
    assert!(out[0].bbox[2] <= 1279.0);
    assert!(out[0].bbox[0] >= 0.0);
}

#[test]
fn letterbox_then_remap_recovers_the_full_photo() {
    let img = RgbImage::new(1000, 500);
    let (_, plan) = Letterbox::new(640, 640).run(&img).unwrap();

    // a detection covering the whole content region of the canvas
    let (cw, ch) = plan.content_size();
    let full = det(
        [
            plan.pad.0 as f32,
            plan.pad.1 as f32,
            (plan.pad.0 + cw) as f32,
            (plan.pad.1 + ch) as f32,
        ],
        1.0,
    );
    let out = remap_detections(vec![full], &plan);
    assert_eq!(out.len(), 1);

    let [x1, y1, x2, y2] = out[0].bbox;
    assert!(x1.abs() < 1.5 && y1.abs() < 1.5);
    assert!((x2 - 1000.0).abs() < 1.5 || (999.0 - x2).abs() < 1.5);
    assert!((y2 - 500.0).abs() < 1.5 || (499.0 - y2).abs() < 1.5);
}

#[test]
fn threshold_constant_matches_the_decoder() {
    // anchor exactly at CONF_THRESHOLD is dropped (strictly-greater rule)
    let mut raw = Array2::<f32>::zeros((5, 1));
    raw[[0, 0]] = 100.0;
    raw[[1, 0]] = 100.0;
    raw[[2, 0]] = 50.0;
    raw[[3, 0]] = 50.0;
    raw[[4, 0]] = CONF_THRESHOLD;
    let dets = decode_raw_output(raw.into_dyn().view(), (640, 640)).unwrap();
    assert!(dets.is_empty());
}
