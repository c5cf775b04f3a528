//! Per-epoch metric history and its JSON file format.
//!
//! The file is one flat JSON object mapping a metric name to the list of its
//! per-epoch values, e.g. `{"loss": [0.9, 0.7], "val_loss": [1.0, 0.8]}`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const LOSS: &str = "loss";
pub const ACCURACY: &str = "accuracy";
pub const VAL_LOSS: &str = "val_loss";
pub const VAL_ACCURACY: &str = "val_accuracy";
pub const LEARNING_RATE: &str = "learning_rate";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    metrics: BTreeMap<String, Vec<f64>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one epoch value, coercing it to `f64`.
    pub fn record<V: Into<f64>>(&mut self, name: &str, value: V) {
        self.metrics
            .entry(name.to_string())
            .or_default()
            .push(value.into());
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.metrics.get(name).map(Vec::as_slice)
    }

    pub fn latest(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(|values| values.last().copied())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// Number of epochs recorded, taken from the longest series.
    pub fn num_epochs(&self) -> usize {
        self.metrics.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl Serialize for History {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        // serde_json writes non-finite floats as null
        self.metrics.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for History {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, Vec<Option<f64>>>::deserialize(deserializer)?;
        let metrics = raw
            .into_iter()
            .map(|(name, values)| {
                let values = values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                (name, values)
            })
            .collect();
        Ok(Self { metrics })
    }
}
