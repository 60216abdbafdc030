use ndarray::{Array2, Array5, Axis, array};
use odal::Config;
use textbox::{
    AnchorGenerator, BoxCoder, Detector, LayerPredictions, LossAssembler, LossInputs,
    MatchPolicy, Matcher, TextboxNet, TextboxParams, matcher::FORCED_MATCH_SCORE,
};

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

fn single_layer_params() -> TextboxParams {
    TextboxParams {
        image_shape: (300, 300),
        feat_layers: vec!["global".into()],
        feat_shapes: vec![(2, 2)],
        anchor_ratios: vec![1.0, 5.0],
        normalizations: vec![-1],
        anchor_sizes: vec![(60.0, 240.0)],
        anchor_steps: vec![150],
        scales: vec![0.2],
        ..TextboxParams::default()
    }
}

#[test]
fn anchor_matching_ground_truth_is_the_only_positive() {
    let params = single_layer_params();
    let anchors = AnchorGenerator::new(&params)
        .unwrap()
        .with_offset(0.0)
        .unwrap()
        .generate(params.image_shape)
        .unwrap()
        .boxes()
        .unwrap();

    let coder = BoxCoder::new(params.prior_scaling);
    let matcher = Matcher::new(params.match_threshold, coder);
    let gt = array![[0.4, 0.4, 0.6, 0.6]];

    let matched = matcher.match_anchors(anchors.view(), gt.view()).unwrap();
    assert_eq!(matched.num_positive(), 1);

    let (index, _) = matched
        .positive
        .indexed_iter()
        .find(|(_, positive)| **positive)
        .unwrap();
    assert!(close(matched.scores[index], 1.0));
    assert!(matched.offsets.row(index).iter().all(|v| close(*v, 0.0)));
    assert_eq!(matched.assigned[index], Some(0));

    // predicting the targets exactly leaves only the classification loss
    let logits = Array2::zeros((matched.len(), 2));
    let inputs = LossInputs::new(
        logits.view(),
        matched.scores.view(),
        matched.offsets.view(),
        matched.offsets.view(),
    );
    let terms = LossAssembler::new(params.match_threshold)
        .compute(&inputs)
        .unwrap();

    assert!(close(terms.loc, 0.0));
    assert!(close(terms.cross_pos, 2.0_f32.ln()));
}

#[test]
fn ensure_coverage_assigns_every_ground_truth() {
    let params = TextboxParams::default();
    let net = TextboxNet::new(params).unwrap();
    let gt = array![
        [0.05, 0.05, 0.07, 0.3],
        [0.5, 0.5, 0.53, 0.9],
        [0.8, 0.1, 0.95, 0.2]
    ];

    let thresholded = net.bboxes_encode(gt.view()).unwrap();
    let threshold = net.params().match_threshold;
    let covered = net
        .with_match_policy(MatchPolicy::EnsureCoverage)
        .bboxes_encode(gt.view())
        .unwrap();

    for k in 0..gt.nrows() {
        // every box overlaps some anchor, even when no overlap clears the threshold
        let overlapping = thresholded
            .assigned
            .iter()
            .zip(&thresholded.scores)
            .any(|(assigned, score)| *assigned == Some(k) && *score > 0.0);
        assert!(overlapping, "ground truth {k} overlaps no anchor");

        let assigned_positive = covered
            .assigned
            .iter()
            .zip(&covered.positive)
            .any(|(assigned, positive)| *assigned == Some(k) && *positive);
        assert!(assigned_positive, "ground truth {k} has no positive anchor");
    }

    // forced anchors carry a score above every threshold
    let forced = covered
        .scores
        .iter()
        .filter(|score| **score == FORCED_MATCH_SCORE)
        .count();
    assert_eq!(forced, gt.nrows());
    for (score, positive) in covered.scores.iter().zip(&covered.positive) {
        assert_eq!(*positive, *score > threshold);
    }

    // forcing matches only ever adds positives
    assert!(covered.num_positive() >= thresholded.num_positive());
    for (forced, plain) in covered.positive.iter().zip(&thresholded.positive) {
        assert!(*forced || !*plain);
    }
}

#[test]
fn confident_anchor_is_detected() {
    let params = single_layer_params();
    let num_box = params.num_box();
    let net = TextboxNet::new(params)
        .unwrap()
        .with_detector(Detector::default().with_select_threshold(0.9));

    let mut logits = Array5::zeros((2, 2, 2, num_box, 2));
    logits[[1, 1, 0, 0, 1]] = 10.0;
    let predictions =
        LayerPredictions::new(logits, Array5::zeros((2, 2, 2, num_box, 4))).unwrap();

    let detections = net.detected_bboxes(&[predictions]).unwrap();
    assert_eq!(detections.len(), 1);

    let detection = detections.iter().next().unwrap();
    assert!(detection.score > 0.99);

    // the anchor of the last cell, variant 0, first ratio
    let anchors = net.anchor_boxes();
    let row = anchors.index_axis(Axis(0), (3 * 2) * num_box);
    let (yc, xc, h, w) = (row[0], row[1], row[2], row[3]);
    let [ymin, xmin, ymax, xmax] = <[f32; 4]>::from(detection.bbox);

    assert!(close(ymin, yc - h / 2.0));
    assert!(close(xmin, xc - w / 2.0));
    assert!(close(ymax, yc + h / 2.0));
    assert!(close(xmax, xc + w / 2.0));
}

#[test]
fn detector_loads_with_overlay() {
    let main = tempfile::tempdir().unwrap();
    let overlay = tempfile::tempdir().unwrap();

    let params = TextboxParams::default();
    params.store(main.path()).unwrap();

    let tuned = TextboxParams {
        match_threshold: 0.6,
        ..params.clone()
    };
    tuned.save_as_overlay(&params, overlay.path()).unwrap();

    let net = TextboxNet::from_config(main.path(), overlay.path()).unwrap();
    assert!(close(net.params().match_threshold, 0.6));
    assert_eq!(net.params().feat_shapes, params.feat_shapes);
}

#[test]
fn malformed_overlay_is_rejected() {
    let main = tempfile::tempdir().unwrap();
    let overlay = tempfile::tempdir().unwrap();

    let params = TextboxParams::default();
    params.store(main.path()).unwrap();

    let broken = TextboxParams {
        scales: vec![0.2, 0.4],
        ..params.clone()
    };
    broken.save_as_overlay(&params, overlay.path()).unwrap();

    assert!(matches!(
        TextboxNet::from_config(main.path(), overlay.path()),
        Err(textbox::Error::LengthMismatch {
            field: "scales",
            ..
        })
    ));
}
