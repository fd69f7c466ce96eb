//! Estimator configuration.
//!
//! Loaded from JSON by the training setup; every field has a default so a
//! config file only needs to name what it changes.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::EstimatorDims;
use crate::error::{MiError, Result};
use crate::layers::WeightInit;

/// Options shared by every estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Softly clamp predicted log-variances into `[min_logvar, max_logvar]`
    pub soft_plus: bool,
    /// Conditioned estimators: shuffle `x` (true) or the conditioning rows (false)
    pub random_is_x: bool,
    pub max_logvar: f32,
    pub min_logvar: f32,
    pub weight_init: WeightInit,
    /// Added to the self term of the leave-one-out matrix
    pub l1out_diagonal_penalty: f32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            soft_plus: false,
            random_is_x: true,
            max_logvar: 0.5,
            min_logvar: -10.0,
            weight_init: WeightInit::TorchDefault,
            l1out_diagonal_penalty: -20.0,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_logvar < self.max_logvar) {
            return Err(MiError::invalid_parameter(
                "min_logvar".to_string(),
                format!(
                    "must be below max_logvar ({} >= {})",
                    self.min_logvar, self.max_logvar
                ),
            ));
        }
        if !self.l1out_diagonal_penalty.is_finite() || self.l1out_diagonal_penalty > 0.0 {
            return Err(MiError::invalid_parameter(
                "l1out_diagonal_penalty".to_string(),
                format!("must be finite and non-positive, got {}", self.l1out_diagonal_penalty),
            ));
        }
        self.weight_init.validate()
    }
}

/// Which bound an estimator computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    Club,
    ClubSample,
    ConClubSample,
    SyncedConClubSample,
    Mine,
    Nwj,
    InfoNce,
    L1Out,
    VarUb,
}

impl EstimatorKind {
    /// Upper-bound estimators may legitimately report negative values
    pub fn is_upper_bound(&self) -> bool {
        !matches!(self, EstimatorKind::Mine | EstimatorKind::Nwj | EstimatorKind::InfoNce)
    }

    pub fn is_conditioned(&self) -> bool {
        matches!(self, EstimatorKind::ConClubSample | EstimatorKind::SyncedConClubSample)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EstimatorKind::Club => "club",
            EstimatorKind::ClubSample => "club_sample",
            EstimatorKind::ConClubSample => "con_club_sample",
            EstimatorKind::SyncedConClubSample => "synced_con_club_sample",
            EstimatorKind::Mine => "mine",
            EstimatorKind::Nwj => "nwj",
            EstimatorKind::InfoNce => "info_nce",
            EstimatorKind::L1Out => "l1out",
            EstimatorKind::VarUb => "var_ub",
        }
    }
}

/// Everything needed to construct one estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorSpec {
    pub kind: EstimatorKind,
    pub x_dim: usize,
    pub y_dim: usize,
    #[serde(default)]
    pub con_dim: Option<usize>,
    pub hidden_size: usize,
    #[serde(default)]
    pub config: EstimatorConfig,
}

impl EstimatorSpec {
    pub fn new(kind: EstimatorKind, x_dim: usize, y_dim: usize, hidden_size: usize) -> Self {
        EstimatorSpec {
            kind,
            x_dim,
            y_dim,
            con_dim: None,
            hidden_size,
            config: EstimatorConfig::default(),
        }
    }

    pub fn with_con_dim(mut self, con_dim: usize) -> Self {
        self.con_dim = Some(con_dim);
        self
    }

    pub fn with_config(mut self, config: EstimatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dims(&self) -> EstimatorDims {
        EstimatorDims {
            x_dim: self.x_dim,
            y_dim: self.y_dim,
            con_dim: self.con_dim,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.x_dim == 0 || self.y_dim == 0 {
            return Err(MiError::invalid_parameter(
                "dims".to_string(),
                format!("x_dim and y_dim must be positive, got {} and {}", self.x_dim, self.y_dim),
            ));
        }
        match (self.kind.is_conditioned(), self.con_dim) {
            (true, None) | (true, Some(0)) => {
                return Err(MiError::invalid_parameter(
                    "con_dim",
                    "conditioned estimators need a positive con_dim",
                ))
            }
            (false, Some(_)) => {
                return Err(MiError::invalid_parameter(
                    "con_dim".to_string(),
                    format!("{} does not take conditioning samples", self.kind.name()),
                ))
            }
            _ => {}
        }
        if self.hidden_size < 2 {
            return Err(MiError::invalid_parameter(
                "hidden_size".to_string(),
                format!("must be at least 2, got {}", self.hidden_size),
            ));
        }
        self.config.validate()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let spec: EstimatorSpec = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
