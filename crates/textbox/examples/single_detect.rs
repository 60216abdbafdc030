use miette::Result;
use ndarray::{Array3, Array5, array};
use rand::{Rng, SeedableRng, rngs::StdRng};
use textbox::{
    Detector, LayerPredictions, MatchPolicy, Preprocessor, TextboxNet, TextboxParams,
    backbone::Backbone,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let params = TextboxParams::default();
    Backbone::textbox300().check(&params)?;

    let net = TextboxNet::new(params.clone())?
        .with_match_policy(MatchPolicy::EnsureCoverage)
        .with_detector(Detector::default().with_select_threshold(0.6));

    let mut rng = StdRng::seed_from_u64(42);

    // a synthetic image with a single line of text
    let image = Array3::from_shape_fn((480, 640, 3), |(y, x, _)| {
        if (200..260).contains(&y) && (100..500).contains(&x) {
            20.0
        } else {
            230.0
        }
    });
    let gt_boxes = array![[200.0 / 480.0, 100.0 / 640.0, 260.0 / 480.0, 500.0 / 640.0]];

    let (input, gt_boxes) =
        Preprocessor::from_params(&params).train(&mut rng, image.view(), gt_boxes.view())?;
    tracing::info!(input = ?input.dim(), "preprocessed image");

    let targets = net.bboxes_encode(gt_boxes.view())?;
    tracing::info!(positives = targets.num_positive(), "matched ground truth");

    // stand-in for the network outputs
    let num_box = params.num_box();
    let predictions = params
        .feat_shapes
        .iter()
        .map(|&(h, w)| {
            LayerPredictions::new(
                Array5::from_shape_fn((h, w, 2, num_box, 2), |_| rng.random_range(-2.0..2.0)),
                Array5::from_shape_fn((h, w, 2, num_box, 4), |_| rng.random_range(-0.1..0.1)),
            )
        })
        .collect::<textbox::Result<Vec<_>>>()?;

    let terms = net.losses(std::slice::from_ref(&predictions), &[targets])?;
    tracing::info!(?terms, "loss");

    let detections = net.detected_bboxes(&predictions)?;
    for detection in &detections {
        println!("{:.3} {:?}", detection.score, detection.bbox);
    }

    Ok(())
}
