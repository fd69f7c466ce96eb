use approx::assert_abs_diff_eq;
use ndarray::{arr1, s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::samples;
use crate::batch::SampleBatch;
use crate::config::{EstimatorConfig, EstimatorKind, EstimatorSpec};
use crate::error::MiError;
use crate::estimators::{build_estimator, ClubSample, ConClubSample, L1OutUb, Mine, MiEstimator, SyncedConClubSample};
use crate::optimizer::{OptimizerWrapper, SGD};
use crate::sampling::Pairing;

const ALL_KINDS: [EstimatorKind; 9] = [
    EstimatorKind::Club,
    EstimatorKind::ClubSample,
    EstimatorKind::ConClubSample,
    EstimatorKind::SyncedConClubSample,
    EstimatorKind::Mine,
    EstimatorKind::Nwj,
    EstimatorKind::InfoNce,
    EstimatorKind::L1Out,
    EstimatorKind::VarUb,
];

fn spec(kind: EstimatorKind) -> EstimatorSpec {
    let spec = EstimatorSpec::new(kind, 3, 2, 8);
    if kind.is_conditioned() {
        spec.with_con_dim(2)
    } else {
        spec
    }
}

fn estimator(kind: EstimatorKind) -> Box<dyn MiEstimator> {
    build_estimator(&spec(kind), &mut StdRng::seed_from_u64(42)).unwrap()
}

#[test]
fn test_single_selected_row_gives_zero_for_club_family() {
    let data = samples(5, 3, 2, 2, 1);
    let mask = arr1(&[false, false, true, false, false]);
    for kind in [
        EstimatorKind::Club,
        EstimatorKind::ClubSample,
        EstimatorKind::ConClubSample,
        EstimatorKind::SyncedConClubSample,
    ] {
        let mut est = estimator(kind);
        let mut batch = SampleBatch::new(data.x.view(), data.y.view()).with_mask(mask.view());
        if kind.is_conditioned() {
            batch = batch.with_con(data.con.view());
        }
        let bound = est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(bound.value, 0.0, "{} single-row bound", kind.name());
    }
}

#[test]
fn test_empty_mask_is_rejected_by_every_estimator() {
    let data = samples(4, 3, 2, 2, 2);
    let mask = Array1::from_elem(4, false);
    for kind in ALL_KINDS {
        let mut est = estimator(kind);
        let mut batch = SampleBatch::new(data.x.view(), data.y.view()).with_mask(mask.view());
        if kind.is_conditioned() {
            batch = batch.with_con(data.con.view());
        }
        let err = est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(matches!(err, MiError::InvalidMask(_)), "{}: {:?}", kind.name(), err);
        assert!(est.learning_loss(&batch, &mut StdRng::seed_from_u64(0)).is_err());
    }
}

#[test]
fn test_mask_length_mismatch_is_shape_error() {
    let data = samples(8, 3, 2, 2, 3);
    let mask = Array1::from_elem(7, true);
    let mut est = estimator(EstimatorKind::ClubSample);
    let batch = SampleBatch::new(data.x.view(), data.y.view()).with_mask(mask.view());
    let err = est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)).unwrap_err();
    assert!(matches!(err, MiError::ShapeMismatch { .. }));
}

#[test]
fn test_conditioned_estimators_require_conditioning() {
    let data = samples(4, 3, 2, 2, 4);
    for kind in [EstimatorKind::ConClubSample, EstimatorKind::SyncedConClubSample] {
        let mut est = estimator(kind);
        let batch = SampleBatch::new(data.x.view(), data.y.view());
        let err = est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert_eq!(err, MiError::MissingConditioning);
    }
}

#[test]
fn test_unconditioned_estimator_rejects_conditioning() {
    let data = samples(4, 3, 2, 2, 4);
    let mut est = estimator(EstimatorKind::Club);
    let batch = SampleBatch::new(data.x.view(), data.y.view()).with_con(data.con.view());
    assert!(matches!(
        est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)),
        Err(MiError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_l1out_needs_two_rows() {
    let data = samples(4, 3, 2, 2, 5);
    let mut est = L1OutUb::new(3, 2, 8, EstimatorConfig::default(), &mut StdRng::seed_from_u64(0)).unwrap();
    let one = arr1(&[false, true, false, false]);
    let batch = SampleBatch::new(data.x.view(), data.y.view()).with_mask(one.view());
    let err = est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)).unwrap_err();
    assert_eq!(err, MiError::InsufficientBatchSize { required: 2, actual: 1 });

    let two = arr1(&[false, true, true, false]);
    let batch = SampleBatch::new(data.x.view(), data.y.view()).with_mask(two.view());
    assert!(est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)).unwrap().value.is_finite());
}

#[test]
fn test_learning_loss_is_negative_loglikelihood() {
    let data = samples(6, 3, 2, 2, 6);
    let batch = SampleBatch::new(data.x.view(), data.y.view());
    let mut rng = StdRng::seed_from_u64(0);

    let mut club_sample = ClubSample::new(3, 2, 8, EstimatorConfig::default(), &mut rng).unwrap();
    let loss = club_sample.learning_loss(&batch, &mut rng).unwrap();
    assert_abs_diff_eq!(loss, -club_sample.loglikeli(&batch).unwrap());

    let mut l1out = L1OutUb::new(3, 2, 8, EstimatorConfig::default(), &mut rng).unwrap();
    let loss = l1out.learning_loss(&batch, &mut rng).unwrap();
    assert_abs_diff_eq!(loss, -l1out.loglikeli(&batch).unwrap());

    let conditioned = batch.with_con(data.con.view());
    let mut con_club = ConClubSample::new(3, 2, 2, 8, EstimatorConfig::default(), &mut rng).unwrap();
    let (loss, gradients) = con_club.learning_gradients(&conditioned, &mut rng).unwrap();
    assert_abs_diff_eq!(loss, -con_club.loglikeli(&conditioned).unwrap());
    assert_eq!(gradients.len(), con_club.layers_mut().len());
}

#[test]
fn test_masked_batch_matches_sub_batch() {
    let data = samples(7, 3, 2, 2, 7);
    let mask = arr1(&[true, false, true, true, false, true, true]);
    let kept: Vec<usize> = (0..7).filter(|&i| mask[i]).collect();
    let sub_x = data.x.select(Axis(0), &kept);
    let sub_y = data.y.select(Axis(0), &kept);

    for kind in [EstimatorKind::Club, EstimatorKind::Nwj, EstimatorKind::InfoNce, EstimatorKind::L1Out, EstimatorKind::VarUb] {
        let mut est = estimator(kind);
        let masked = SampleBatch::new(data.x.view(), data.y.view()).with_mask(mask.view());
        let sub = SampleBatch::new(sub_x.view(), sub_y.view());
        let a = est.estimate_bound(&masked, &mut StdRng::seed_from_u64(0)).unwrap().value;
        let b = est.estimate_bound(&sub, &mut StdRng::seed_from_u64(0)).unwrap().value;
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
}

#[test]
fn test_masked_rows_do_not_influence_bound() {
    let data = samples(6, 3, 2, 2, 8);
    let mask = arr1(&[true, true, true, false, true, true]);
    let mut altered_x = data.x.clone();
    altered_x.row_mut(3).fill(1e6);
    let mut altered_y = data.y.clone();
    altered_y.row_mut(3).fill(-1e6);

    for kind in ALL_KINDS {
        let mut est = estimator(kind);
        let mut original = SampleBatch::new(data.x.view(), data.y.view()).with_mask(mask.view());
        let mut altered = SampleBatch::new(altered_x.view(), altered_y.view()).with_mask(mask.view());
        if kind.is_conditioned() {
            original = original.with_con(data.con.view());
            altered = altered.with_con(data.con.view());
        }
        let a = est.estimate_bound(&original, &mut StdRng::seed_from_u64(9)).unwrap().value;
        let b = est.estimate_bound(&altered, &mut StdRng::seed_from_u64(9)).unwrap().value;
        assert_eq!(a, b, "{}", kind.name());
    }
}

#[test]
fn test_explicit_pairing_must_stay_inside_mask() {
    let data = samples(4, 3, 2, 2, 9);
    let mask = arr1(&[true, true, false, true]);
    let selected = [0, 1, 3];
    assert!(matches!(Pairing::from_partners(&selected, &[1, 2, 0]), Err(MiError::InvalidMask(_))));

    let mut est = ClubSample::new(3, 2, 8, EstimatorConfig::default(), &mut StdRng::seed_from_u64(0)).unwrap();
    let batch = SampleBatch::new(data.x.view(), data.y.view()).with_mask(mask.view());
    let wrong_anchors = Pairing::identity(&[0, 1, 2]).unwrap();
    assert!(matches!(est.estimate_bound_with_pairing(&batch, &wrong_anchors), Err(MiError::InvalidMask(_))));

    let pairing = Pairing::from_partners(&selected, &[3, 0, 1]).unwrap();
    assert!(est.estimate_bound_with_pairing(&batch, &pairing).unwrap().value.is_finite());
    let identity = Pairing::identity(&selected).unwrap();
    assert_eq!(est.estimate_bound_with_pairing(&batch, &identity).unwrap().value, 0.0);
}

#[test]
fn test_mine_with_identity_pairing_is_zero() {
    let data = samples(5, 3, 2, 2, 10);
    let mut mine = Mine::new(3, 2, 8, EstimatorConfig::default(), &mut StdRng::seed_from_u64(0)).unwrap();
    let batch = SampleBatch::new(data.x.view(), data.y.view());
    let identity = Pairing::identity(&[0, 1, 2, 3, 4]).unwrap();
    let value = mine.estimate_bound_with_pairing(&batch, &identity).unwrap().value;
    // mean(T) - log(mean(exp(T))) <= 0 by Jensen, with equality only for constant T
    assert!(value <= 1e-6);
}

#[test]
fn test_infonce_never_exceeds_log_batch_size() {
    let data = samples(16, 3, 2, 2, 11);
    let mut est = estimator(EstimatorKind::InfoNce);
    let batch = SampleBatch::new(data.x.view(), data.y.view());
    let mut optimizer = OptimizerWrapper::SGD(SGD::new());
    for _ in 0..20 {
        est.learning_step(&batch, &mut StdRng::seed_from_u64(0), &mut optimizer, 0.5).unwrap();
        let value = est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)).unwrap().value;
        assert!(value <= (16.0f32).ln() + 1e-5);
    }
}

#[test]
fn test_bound_estimate_reports_gaussian_params() {
    let data = samples(5, 3, 2, 2, 12);
    let mask = arr1(&[true, true, false, true, true]);
    for kind in ALL_KINDS {
        let mut est = estimator(kind);
        let mut batch = SampleBatch::new(data.x.view(), data.y.view()).with_mask(mask.view());
        if kind.is_conditioned() {
            batch = batch.with_con(data.con.view());
        }
        let bound = est.estimate_bound(&batch, &mut StdRng::seed_from_u64(0)).unwrap();
        match kind {
            EstimatorKind::Mine | EstimatorKind::Nwj | EstimatorKind::InfoNce => assert!(bound.params.is_none()),
            _ => {
                let params = bound.params.unwrap();
                assert_eq!(params.mu.dim(), (4, 2));
                assert_eq!(params.logvar.dim(), (4, 2));
            }
        }
    }
}

#[test]
fn test_var_ub_ignores_y() {
    let data = samples(5, 3, 2, 2, 13);
    let mut est = estimator(EstimatorKind::VarUb);
    let other_y = Array2::<f32>::ones((5, 2));
    let a = est.estimate_bound(&SampleBatch::new(data.x.view(), data.y.view()), &mut StdRng::seed_from_u64(0)).unwrap();
    let (b, gradients) = est
        .bound_gradients(&SampleBatch::new(data.x.view(), other_y.view()), &mut StdRng::seed_from_u64(0))
        .unwrap();
    assert_eq!(a.value, b.value);
    assert!(a.value >= 0.0);
    assert!(gradients.y.iter().all(|&g| g == 0.0));
}

#[test]
fn test_learning_step_moves_parameters() {
    let data = samples(6, 3, 2, 2, 14);
    let batch = SampleBatch::new(data.x.view(), data.y.view());
    let mut est = estimator(EstimatorKind::Club);
    let before = est.snapshot();
    let mut optimizer = OptimizerWrapper::SGD(SGD::new());
    est.learning_step(&batch, &mut StdRng::seed_from_u64(0), &mut optimizer, 0.1).unwrap();
    assert_ne!(est.snapshot(), before);
}

#[test]
fn test_synced_estimator_follows_external_encoder() {
    let data = samples(6, 3, 2, 2, 15);
    let mut rng = StdRng::seed_from_u64(0);
    let mut follower = SyncedConClubSample::new(3, 2, 2, 8, EstimatorConfig::default(), &mut rng).unwrap();
    let leader = SyncedConClubSample::new(3, 2, 2, 8, EstimatorConfig::default(), &mut rng).unwrap();
    assert_ne!(follower.snapshot(), leader.snapshot());
    assert!(follower.layers_mut().is_empty());

    follower.synchronize_parameters(&leader.snapshot()).unwrap();
    assert_eq!(follower.snapshot(), leader.snapshot());

    let batch = SampleBatch::new(data.x.view(), data.y.view()).with_con(data.con.view());
    let (_, gradients) = follower.learning_gradients(&batch, &mut rng).unwrap();
    assert!(gradients.is_empty());

    // A snapshot with a wrongly shaped layer is rejected as a whole
    let mut bad = leader.snapshot();
    let first = bad.get("encoder.0").unwrap().clone();
    bad.insert("encoder.1", Array2::zeros((3, 3)), first.biases.slice(s![..3]).to_owned());
    let before = follower.snapshot();
    assert!(follower.synchronize_parameters(&bad).is_err());
    assert_eq!(follower.snapshot(), before);
}

#[test]
fn test_factory_rejects_invalid_specs() {
    let mut rng = StdRng::seed_from_u64(0);
    assert!(build_estimator(&EstimatorSpec::new(EstimatorKind::ConClubSample, 3, 2, 8), &mut rng).is_err());
    assert!(build_estimator(&EstimatorSpec::new(EstimatorKind::Club, 3, 2, 1), &mut rng).is_err());
    let config = EstimatorConfig { min_logvar: 1.0, max_logvar: 0.0, ..Default::default() };
    assert!(build_estimator(&EstimatorSpec::new(EstimatorKind::Club, 3, 2, 8).with_config(config), &mut rng).is_err());
}
