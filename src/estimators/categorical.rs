//! CLUB between continuous embeddings and categorical labels.
//!
//! `q(label | x)` is a softmax classifier. The bound contrasts the
//! log-probability of each row's own label with the average log-probability
//! of every selected label:
//!
//! `log_mat[i, j] = log_softmax(logits_i)[label_j]`,
//! `bound = mean(diag(log_mat)) - mean(log_mat)`.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use crate::activations::Activation;
use crate::batch::{gather_rows, scatter_add_rows};
use crate::builders::NetworkBuilder;
use crate::error::{MiError, Result};
use crate::estimators::apply_gradients;
use crate::layers::{DenseLayer, LayerGradients, WeightInit};
use crate::network::FeedForward;
use crate::numerics::{ensure_finite, log_sum_exp_keepdim};
use crate::optimizer::OptimizerWrapper;
use crate::sampling::masked_indices;
use crate::snapshot::ParameterSnapshot;

const NETWORK_PREFIX: &str = "variational_net";

#[derive(Debug, Clone)]
pub struct ClubCategorical {
    input_dim: usize,
    label_num: usize,
    network: FeedForward,
}

/// Selected rows with their labels, copied out contiguously.
struct LabelledRows {
    rows: Vec<usize>,
    inputs: Array2<f32>,
    labels: Vec<usize>,
}

impl ClubCategorical {
    /// A linear classifier when `hidden_size` is `None`, otherwise one ReLU
    /// hidden layer.
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        label_num: usize,
        hidden_size: Option<usize>,
        init: WeightInit,
        rng: &mut R,
    ) -> Result<Self> {
        if input_dim == 0 || label_num == 0 {
            return Err(MiError::invalid_parameter(
                "dims".to_string(),
                format!("input_dim ({}) and label_num ({}) must be positive", input_dim, label_num),
            ));
        }
        let mut builder = NetworkBuilder::new(input_dim).with_init(init);
        if let Some(hidden) = hidden_size {
            builder = builder.dense(hidden, Activation::Relu);
        }
        let network = builder.dense(label_num, Activation::Linear).build(rng)?;
        Ok(ClubCategorical { input_dim, label_num, network })
    }

    pub fn label_num(&self) -> usize {
        self.label_num
    }

    fn select(&self, inputs: ArrayView2<f32>, labels: &[usize], mask: Option<ArrayView1<bool>>) -> Result<LabelledRows> {
        if inputs.ncols() != self.input_dim {
            return Err(MiError::shape_mismatch(
                format!("input width {}", self.input_dim),
                format!("{}", inputs.ncols()),
            ));
        }
        if labels.len() != inputs.nrows() {
            return Err(MiError::shape_mismatch(
                format!("{} labels", inputs.nrows()),
                format!("{}", labels.len()),
            ));
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= self.label_num) {
            return Err(MiError::invalid_parameter(
                "labels".to_string(),
                format!("label {} is outside 0..{}", label, self.label_num),
            ));
        }
        let rows = match mask {
            Some(mask) => {
                if mask.len() != inputs.nrows() {
                    return Err(MiError::shape_mismatch(
                        format!("mask length {}", inputs.nrows()),
                        format!("{}", mask.len()),
                    ));
                }
                masked_indices(mask)?
            }
            None if inputs.nrows() == 0 => return Err(MiError::InvalidMask("empty batch".to_string())),
            None => (0..inputs.nrows()).collect(),
        };
        Ok(LabelledRows {
            inputs: gather_rows(inputs, &rows),
            labels: rows.iter().map(|&r| labels[r]).collect(),
            rows,
        })
    }

    fn log_probabilities(&mut self, inputs: &Array2<f32>) -> Array2<f32> {
        let logits = self.network.forward(inputs.view());
        let lse = log_sum_exp_keepdim(&logits, Axis(1));
        logits - &lse
    }

    /// Fraction of the selected rows carrying each label.
    fn label_frequencies(&self, labels: &[usize]) -> Vec<f32> {
        let mut freq = vec![0.0; self.label_num];
        for &label in labels {
            freq[label] += 1.0;
        }
        let n = labels.len() as f32;
        freq.iter_mut().for_each(|f| *f /= n);
        freq
    }

    fn bound_from(&self, log_probs: &Array2<f32>, labels: &[usize]) -> Result<f32> {
        let n = labels.len() as f32;
        let freq = self.label_frequencies(labels);
        let mut total = 0.0;
        for (i, row) in log_probs.outer_iter().enumerate() {
            let expected: f32 = row.iter().zip(&freq).map(|(lp, f)| lp * f).sum();
            total += row[labels[i]] - expected;
        }
        ensure_finite("club_categorical", total / n)
    }

    pub fn estimate_bound(&mut self, inputs: ArrayView2<f32>, labels: &[usize], mask: Option<ArrayView1<bool>>) -> Result<f32> {
        let sel = self.select(inputs, labels, mask)?;
        let log_probs = self.log_probabilities(&sel.inputs);
        self.bound_from(&log_probs, &sel.labels)
    }

    /// Bound and its gradient with respect to every input row (zero for
    /// rows the mask leaves out). Labels are discrete and carry no gradient.
    pub fn bound_gradients(
        &mut self,
        inputs: ArrayView2<f32>,
        labels: &[usize],
        mask: Option<ArrayView1<bool>>,
    ) -> Result<(f32, Array2<f32>)> {
        let sel = self.select(inputs, labels, mask)?;
        let log_probs = self.log_probabilities(&sel.inputs);
        let value = self.bound_from(&log_probs, &sel.labels)?;

        // d bound / d logits = (onehot - label frequencies) / N; softmax terms cancel
        let n = sel.labels.len() as f32;
        let freq = self.label_frequencies(&sel.labels);
        let mut d_logits = Array2::zeros(log_probs.raw_dim());
        for (i, mut row) in d_logits.outer_iter_mut().enumerate() {
            for (k, d) in row.iter_mut().enumerate() {
                *d = -freq[k] / n;
            }
            row[sel.labels[i]] += 1.0 / n;
        }
        let (_, d_selected) = self.network.backward(d_logits.view())?;
        let mut d_inputs = Array2::zeros(inputs.raw_dim());
        scatter_add_rows(&mut d_inputs, &sel.rows, d_selected.view());
        Ok((value, d_inputs))
    }

    /// Mean log-probability of the true labels (negative cross-entropy).
    pub fn loglikeli(&mut self, inputs: ArrayView2<f32>, labels: &[usize], mask: Option<ArrayView1<bool>>) -> Result<f32> {
        let sel = self.select(inputs, labels, mask)?;
        let log_probs = self.log_probabilities(&sel.inputs);
        let total: f32 = sel.labels.iter().enumerate().map(|(i, &l)| log_probs[[i, l]]).sum();
        ensure_finite("club_categorical log-likelihood", total / sel.labels.len() as f32)
    }

    pub fn learning_loss(&mut self, inputs: ArrayView2<f32>, labels: &[usize], mask: Option<ArrayView1<bool>>) -> Result<f32> {
        Ok(-self.loglikeli(inputs, labels, mask)?)
    }

    /// Cross-entropy and its gradient with respect to the classifier.
    pub fn learning_gradients(
        &mut self,
        inputs: ArrayView2<f32>,
        labels: &[usize],
        mask: Option<ArrayView1<bool>>,
    ) -> Result<(f32, Vec<LayerGradients>)> {
        let sel = self.select(inputs, labels, mask)?;
        let log_probs = self.log_probabilities(&sel.inputs);
        let n = sel.labels.len() as f32;
        let total: f32 = sel.labels.iter().enumerate().map(|(i, &l)| log_probs[[i, l]]).sum();
        let loss = ensure_finite("club_categorical cross-entropy", -total / n)?;

        let mut d_logits = log_probs.mapv(|lp| lp.exp() / n);
        for (i, &label) in sel.labels.iter().enumerate() {
            d_logits[[i, label]] -= 1.0 / n;
        }
        let (gradients, _) = self.network.backward(d_logits.view())?;
        Ok((loss, gradients))
    }

    /// One optimizer update on the cross-entropy; returns the loss before it.
    pub fn learning_step(
        &mut self,
        inputs: ArrayView2<f32>,
        labels: &[usize],
        mask: Option<ArrayView1<bool>>,
        optimizer: &mut OptimizerWrapper,
        learning_rate: f32,
    ) -> Result<f32> {
        let (loss, gradients) = self.learning_gradients(inputs, labels, mask)?;
        apply_gradients(self.layers_mut(), &gradients, optimizer, learning_rate)?;
        Ok(loss)
    }

    pub fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        self.network.layers_mut().collect()
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        self.network.snapshot(NETWORK_PREFIX)
    }

    pub fn load_snapshot(&mut self, snapshot: &ParameterSnapshot) -> Result<()> {
        self.network.load_snapshot(NETWORK_PREFIX, snapshot)
    }
}
