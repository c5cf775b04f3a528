use burn::train::metric::{
    state::{FormatOptions, NumericMetricState},
    MetricEntry,
};

/// Sample-weighted running mean of a per-batch value over one epoch.
pub struct EpochMetric {
    name: &'static str,
    state: NumericMetricState,
    sum: f64,
    count: usize,
}

impl EpochMetric {
    pub fn loss() -> Self {
        Self::new("Loss")
    }

    pub fn accuracy() -> Self {
        Self::new("Accuracy")
    }

    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: NumericMetricState::default(),
            sum: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, value: f64, batch_size: usize) -> MetricEntry {
        self.sum += value * batch_size as f64;
        self.count += batch_size;
        self.state
            .update(value, batch_size, FormatOptions::new(self.name).precision(4))
    }

    /// Mean over every sample seen since the last [`clear`](Self::clear).
    pub fn value(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.sum / self.count as f64
    }

    pub fn clear(&mut self) {
        self.state.reset();
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Accumulates loss and accuracy for one pass over a loader.
pub struct PassMetrics {
    pub loss: EpochMetric,
    pub accuracy: EpochMetric,
}

impl PassMetrics {
    pub fn new() -> Self {
        Self {
            loss: EpochMetric::loss(),
            accuracy: EpochMetric::accuracy(),
        }
    }

    pub fn update(
        &mut self,
        loss: f64,
        num_correct: usize,
        batch_size: usize,
    ) -> (MetricEntry, MetricEntry) {
        let accuracy = if batch_size == 0 {
            0.0
        } else {
            num_correct as f64 / batch_size as f64
        };
        (
            self.loss.update(loss, batch_size),
            self.accuracy.update(accuracy, batch_size),
        )
    }
}

impl Default for PassMetrics {
    fn default() -> Self {
        Self::new()
    }
}
