//! Serialized parameter snapshots.
//!
//! A snapshot is an ordered mapping from layer name (`"<prefix>.<index>"`) to
//! that layer's weights (`[in, out]`) and biases. It is the only way parameters
//! move between an externally trained encoder and an estimator that tracks it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LayerParameters {
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ParameterSnapshot {
    layers: BTreeMap<String, LayerParameters>,
}

impl ParameterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, weights: Array2<f32>, biases: Array1<f32>) {
        self.layers.insert(name.into(), LayerParameters { weights, biases });
    }

    pub fn get(&self, name: &str) -> Option<&LayerParameters> {
        self.layers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Add every layer of `other`, replacing entries with the same name.
    pub fn extend(&mut self, other: ParameterSnapshot) {
        self.layers.extend(other.layers);
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Write the snapshot to `path` in the binary encoding.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let serialized = self.to_bytes()?;
        let mut file = fs::File::create(path)?;
        file.write_all(&serialized)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = fs::File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Self::from_bytes(&buffer)
    }
}
