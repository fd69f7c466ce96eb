use mi_bounds::{
    batch::SampleBatch,
    config::{EstimatorConfig, EstimatorKind, EstimatorSpec},
    error::MiError,
    estimators::{build_estimator, ClubCategorical, ConClubSample, MiEstimator, SyncedConClubSample},
    layers::WeightInit,
    optimizer::{Adam, GradientClipper, OptimizerWrapper},
    snapshot::ParameterSnapshot,
    training::EstimatorTrainer,
};
use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn mean_bound(estimator: &mut dyn MiEstimator, batch: &SampleBatch<'_>, draws: u64) -> f32 {
    let total: f32 = (0..draws)
        .map(|seed| estimator.estimate_bound(batch, &mut StdRng::seed_from_u64(1000 + seed)).unwrap().value)
        .sum();
    total / draws as f32
}

#[test]
fn test_club_sample_bound_grows_while_fitting_dependent_data() {
    let mut rng = StdRng::seed_from_u64(2024);
    let x = Array2::<f32>::random_using((8, 4), StandardNormal, &mut rng);
    let y = x.clone();
    let batch = SampleBatch::new(x.view(), y.view());

    let spec = EstimatorSpec::new(EstimatorKind::ClubSample, 4, 4, 8);
    let mut estimator = build_estimator(&spec, &mut rng).unwrap();
    let before = mean_bound(estimator.as_mut(), &batch, 50);

    let mut trainer = EstimatorTrainer::new(OptimizerWrapper::Adam(Adam::default()), 0.01)
        .with_clipper(GradientClipper::ClipByGlobalNorm { max_norm: 10.0 });
    let losses = trainer.fit(estimator.as_mut(), &batch, &mut rng, 200).unwrap();
    assert!(losses[199] < losses[0]);

    let after = mean_bound(estimator.as_mut(), &batch, 50);
    assert!(after > before, "bound did not grow: {} -> {}", before, after);
}

#[test]
fn test_short_mask_fails_before_any_computation() {
    let x = Array2::<f32>::zeros((8, 4));
    let y = Array2::<f32>::zeros((8, 4));
    let mask = Array1::from_elem(7, true);
    let batch = SampleBatch::new(x.view(), y.view()).with_mask(mask.view());

    let spec = EstimatorSpec::new(EstimatorKind::ClubSample, 4, 4, 8);
    let mut rng = StdRng::seed_from_u64(0);
    let mut estimator = build_estimator(&spec, &mut rng).unwrap();
    let before = estimator.snapshot();
    let mut optimizer = OptimizerWrapper::Adam(Adam::default());

    let err = estimator.learning_step(&batch, &mut rng, &mut optimizer, 0.1).unwrap_err();
    assert!(matches!(err, MiError::ShapeMismatch { .. }));
    assert_eq!(estimator.snapshot(), before);
}

#[test]
fn test_synchronization_through_saved_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("encoder.bin");
    let mut rng = StdRng::seed_from_u64(7);

    let leader = SyncedConClubSample::new(3, 2, 2, 16, EstimatorConfig::default(), &mut rng).unwrap();
    leader.snapshot().save(&path).unwrap();

    let mut follower = SyncedConClubSample::new(3, 2, 2, 16, EstimatorConfig::default(), &mut rng).unwrap();
    follower.synchronize_parameters(&ParameterSnapshot::load(&path).unwrap()).unwrap();
    assert_eq!(follower.snapshot(), leader.snapshot());

    // Both now estimate the same bound for the same pairing
    let x = Array2::<f32>::random_using((10, 3), StandardNormal, &mut rng);
    let y = Array2::<f32>::random_using((10, 2), StandardNormal, &mut rng);
    let con = Array2::<f32>::random_using((10, 2), StandardNormal, &mut rng);
    let batch = SampleBatch::new(x.view(), y.view()).with_con(con.view());
    let mut leader = leader;
    let a = leader.estimate_bound(&batch, &mut StdRng::seed_from_u64(3)).unwrap().value;
    let b = follower.estimate_bound(&batch, &mut StdRng::seed_from_u64(3)).unwrap().value;
    assert_eq!(a, b);

    // An independently trained estimator's snapshot has a different layout
    let other = ConClubSample::new(3, 2, 2, 16, EstimatorConfig::default(), &mut rng).unwrap();
    assert!(follower.synchronize_parameters(&other.snapshot()).is_err());
}

#[test]
fn test_factory_from_json_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("estimator.json");
    std::fs::write(
        &path,
        r#"{
            "kind": "con_club_sample",
            "x_dim": 3,
            "y_dim": 2,
            "con_dim": 2,
            "hidden_size": 16,
            "config": { "random_is_x": false, "soft_plus": true }
        }"#,
    )
    .unwrap();

    let spec = EstimatorSpec::from_json_file(&path).unwrap();
    assert!(!spec.config.random_is_x);
    let mut rng = StdRng::seed_from_u64(1);
    let mut estimator = build_estimator(&spec, &mut rng).unwrap();
    assert_eq!(estimator.kind(), EstimatorKind::ConClubSample);

    let x = Array2::<f32>::random_using((6, 3), StandardNormal, &mut rng);
    let y = Array2::<f32>::random_using((6, 2), StandardNormal, &mut rng);
    let con = Array2::<f32>::random_using((6, 2), StandardNormal, &mut rng);
    let batch = SampleBatch::new(x.view(), y.view()).with_con(con.view());
    let (bound, gradients) = estimator.bound_gradients(&batch, &mut rng).unwrap();
    assert!(bound.value.is_finite());
    assert_eq!(gradients.con.unwrap().dim(), (6, 2));
}

#[test]
fn test_categorical_bound_detects_label_dependence() {
    let mut rng = StdRng::seed_from_u64(9);
    let labels: Vec<usize> = (0..30).map(|i| i % 3).collect();
    let mut x = Array2::<f32>::random_using((30, 4), StandardNormal, &mut rng) * 0.1;
    for (i, &label) in labels.iter().enumerate() {
        x[[i, label]] += 3.0;
    }

    let mut estimator = ClubCategorical::new(4, 3, Some(16), WeightInit::TorchDefault, &mut rng).unwrap();
    let mut optimizer = OptimizerWrapper::Adam(Adam::default());
    for _ in 0..150 {
        estimator.learning_step(x.view(), &labels, None, &mut optimizer, 0.02).unwrap();
    }
    let bound = estimator.estimate_bound(x.view(), &labels, None).unwrap();
    assert!(bound.is_finite() && bound > 0.5, "unexpected bound {}", bound);

    // Shuffling labels against the embeddings removes the dependence
    let shuffled: Vec<usize> = (0..30).map(|i| (i / 10) % 3).collect();
    let unrelated = estimator.estimate_bound(x.view(), &shuffled, None).unwrap();
    assert!(unrelated < bound);
}
