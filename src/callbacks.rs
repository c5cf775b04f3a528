//! Per-epoch monitoring hooks: early stopping, learning-rate decay on plateau
//! and best-model checkpointing. Each hook watches one metric from the
//! training [`History`].

use burn::config::Config;
use log::{info, warn};

use crate::history::{History, VAL_ACCURACY, VAL_LOSS};

/// Whether a monitored metric improves by going down or up.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Mode {
    Min,
    Max,
    /// `Max` for accuracy-like metric names, `Min` otherwise.
    Auto,
}

impl Mode {
    fn resolve(&self, monitor: &str) -> Mode {
        match self {
            Mode::Auto if monitor.contains("acc") => Mode::Max,
            Mode::Auto => Mode::Min,
            Mode::Min => Mode::Min,
            Mode::Max => Mode::Max,
        }
    }
}

/// Tracks the best value of a metric under a given mode and tolerance.
#[derive(Debug, Clone)]
struct Monitor {
    name: String,
    mode: Mode,
    min_delta: f64,
    best: f64,
}

impl Monitor {
    fn new(name: &str, mode: &Mode, min_delta: f64) -> Self {
        let mode = mode.resolve(name);
        let best = match mode {
            Mode::Max => f64::NEG_INFINITY,
            _ => f64::INFINITY,
        };
        Self {
            name: name.to_string(),
            mode,
            min_delta: min_delta.abs(),
            best,
        }
    }

    fn current(&self, history: &History) -> Option<f64> {
        let value = history.latest(&self.name);
        if value.is_none() {
            warn!(
                "Monitored metric '{}' is not available, available metrics are: {}",
                self.name,
                history.names().collect::<Vec<_>>().join(", ")
            );
        }
        value
    }

    fn is_improvement(&self, value: f64) -> bool {
        match self.mode {
            Mode::Max => value - self.min_delta > self.best,
            _ => value + self.min_delta < self.best,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Stop,
}

#[derive(Config, Debug)]
pub struct EarlyStoppingConfig {
    #[config(default = "VAL_LOSS.to_string()")]
    pub monitor: String,
    #[config(default = "Mode::Auto")]
    pub mode: Mode,
    /// Epochs without improvement before training stops.
    #[config(default = 10)]
    pub patience: usize,
    #[config(default = 0.0)]
    pub min_delta: f64,
    /// Restore the weights of the best epoch when stopping.
    #[config(default = true)]
    pub restore_best_weights: bool,
}

impl EarlyStoppingConfig {
    pub fn init<M: Clone>(&self) -> EarlyStopping<M> {
        EarlyStopping {
            monitor: Monitor::new(&self.monitor, &self.mode, self.min_delta),
            patience: self.patience,
            restore_best_weights: self.restore_best_weights,
            wait: 0,
            best_epoch: None,
            best_weights: None,
            stopped_epoch: None,
        }
    }
}

/// Holds on to a copy of the best model seen so far so it can be restored.
pub struct EarlyStopping<M> {
    monitor: Monitor,
    patience: usize,
    restore_best_weights: bool,
    wait: usize,
    best_epoch: Option<usize>,
    best_weights: Option<M>,
    stopped_epoch: Option<usize>,
}

impl<M: Clone> EarlyStopping<M> {
    pub fn on_epoch_end(&mut self, epoch: usize, history: &History, model: &M) -> Signal {
        let Some(current) = self.monitor.current(history) else {
            return Signal::Continue;
        };

        if self.monitor.is_improvement(current) {
            self.monitor.best = current;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            if self.restore_best_weights {
                self.best_weights = Some(model.clone());
            }
            return Signal::Continue;
        }

        self.wait += 1;
        if self.wait >= self.patience && epoch > 0 {
            self.stopped_epoch = Some(epoch);
            info!(
                "Epoch {}: early stopping, '{}' has not improved since epoch {}",
                epoch + 1,
                self.monitor.name,
                self.best_epoch.map(|e| e + 1).unwrap_or(0)
            );
            return Signal::Stop;
        }
        Signal::Continue
    }

    /// Weights to continue with once training ends: the best ones when the run
    /// was stopped early and restoring is enabled, the given ones otherwise.
    pub fn finish(&mut self, model: M) -> M {
        if self.stopped_epoch.is_none() {
            return model;
        }
        match self.best_weights.take() {
            Some(best) => {
                info!(
                    "Restoring model weights from the end of the best epoch: {}",
                    self.best_epoch.map(|e| e + 1).unwrap_or(0)
                );
                best
            }
            None => model,
        }
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

#[derive(Config, Debug)]
pub struct ReduceLrOnPlateauConfig {
    #[config(default = "VAL_LOSS.to_string()")]
    pub monitor: String,
    #[config(default = "Mode::Auto")]
    pub mode: Mode,
    /// The learning rate is multiplied by this factor on a plateau.
    #[config(default = 0.5)]
    pub factor: f64,
    #[config(default = 5)]
    pub patience: usize,
    #[config(default = 1.0e-6)]
    pub min_lr: f64,
    #[config(default = 1.0e-4)]
    pub min_delta: f64,
    /// Epochs to wait after a reduction before counting again.
    #[config(default = 0)]
    pub cooldown: usize,
}

impl ReduceLrOnPlateauConfig {
    pub fn init(&self) -> ReduceLrOnPlateau {
        ReduceLrOnPlateau {
            monitor: Monitor::new(&self.monitor, &self.mode, self.min_delta),
            factor: self.factor,
            patience: self.patience,
            min_lr: self.min_lr,
            cooldown: self.cooldown,
            wait: 0,
            cooldown_counter: 0,
        }
    }
}

pub struct ReduceLrOnPlateau {
    monitor: Monitor,
    factor: f64,
    patience: usize,
    min_lr: f64,
    cooldown: usize,
    wait: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    /// Returns the learning rate for the next epoch.
    pub fn on_epoch_end(&mut self, epoch: usize, history: &History, learning_rate: f64) -> f64 {
        let Some(current) = self.monitor.current(history) else {
            return learning_rate;
        };

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.wait = 0;
        }

        if self.monitor.is_improvement(current) {
            self.monitor.best = current;
            self.wait = 0;
        } else if self.cooldown_counter == 0 {
            self.wait += 1;
            if self.wait >= self.patience {
                self.wait = 0;
                if learning_rate > self.min_lr {
                    let reduced = (learning_rate * self.factor).max(self.min_lr);
                    info!(
                        "Epoch {}: reducing learning rate from {learning_rate:e} to {reduced:e}",
                        epoch + 1
                    );
                    self.cooldown_counter = self.cooldown;
                    return reduced;
                }
            }
        }
        learning_rate
    }
}

#[derive(Config, Debug)]
pub struct CheckpointConfig {
    #[config(default = "VAL_ACCURACY.to_string()")]
    pub monitor: String,
    #[config(default = "Mode::Max")]
    pub mode: Mode,
    /// Only save when the monitored metric improves.
    #[config(default = true)]
    pub save_best_only: bool,
    /// Record file name inside the artifact directory.
    #[config(default = "String::from(\"best_model\")")]
    pub filename: String,
}

impl CheckpointConfig {
    pub fn init(&self) -> ModelCheckpoint {
        ModelCheckpoint {
            monitor: Monitor::new(&self.monitor, &self.mode, 0.0),
            save_best_only: self.save_best_only,
            best_epoch: None,
        }
    }
}

/// Decides when the current model should be written to the checkpoint file.
pub struct ModelCheckpoint {
    monitor: Monitor,
    save_best_only: bool,
    best_epoch: Option<usize>,
}

impl ModelCheckpoint {
    /// `true` when the model of this epoch must be persisted.
    pub fn on_epoch_end(&mut self, epoch: usize, history: &History) -> bool {
        if !self.save_best_only {
            return true;
        }
        let Some(current) = self.monitor.current(history) else {
            return false;
        };
        if self.monitor.is_improvement(current) {
            info!(
                "Epoch {}: {} improved from {:.5} to {current:.5}, saving model",
                epoch + 1,
                self.monitor.name,
                self.monitor.best
            );
            self.monitor.best = current;
            self.best_epoch = Some(epoch);
            return true;
        }
        false
    }

    /// Best monitored value written so far.
    pub fn best(&self) -> Option<f64> {
        self.best_epoch.map(|_| self.monitor.best)
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_with(name: &str, value: f64) -> History {
        let mut history = History::new();
        history.record(name, value);
        history
    }

    #[test]
    fn auto_mode_follows_metric_name() {
        assert_eq!(Mode::Auto.resolve("val_accuracy"), Mode::Max);
        assert_eq!(Mode::Auto.resolve("val_loss"), Mode::Min);
        assert_eq!(Mode::Min.resolve("val_accuracy"), Mode::Min);
    }

    #[test]
    fn early_stopping_restores_minimum_loss_weights() {
        let mut stopper = EarlyStoppingConfig::new().init::<usize>();
        // Minimum at epoch 3, then strictly increasing.
        let losses = [
            1.0, 0.8, 0.6, 0.5, 0.51, 0.52, 0.53, 0.54, 0.55, 0.56, 0.57, 0.58, 0.59, 0.6,
        ];

        // The "weights" of epoch e are e * 100.
        let mut stopped_at = None;
        for (epoch, &loss) in losses.iter().enumerate() {
            let history = history_with(VAL_LOSS, loss);
            if stopper.on_epoch_end(epoch, &history, &(epoch * 100)) == Signal::Stop {
                stopped_at = Some(epoch);
                break;
            }
        }

        assert_eq!(stopped_at, Some(3 + 10));
        assert_eq!(stopper.best_epoch(), Some(3));
        assert_eq!(stopper.finish(1300), 300);
    }

    #[test]
    fn early_stopping_keeps_last_weights_without_stop() {
        let mut stopper = EarlyStoppingConfig::new().init::<usize>();
        for (epoch, loss) in [0.5, 0.6, 0.7].into_iter().enumerate() {
            let signal = stopper.on_epoch_end(epoch, &history_with(VAL_LOSS, loss), &epoch);
            assert_eq!(signal, Signal::Continue);
        }
        assert_eq!(stopper.stopped_epoch(), None);
        assert_eq!(stopper.finish(2), 2);
    }

    #[test]
    fn early_stopping_ignores_missing_metric() {
        let mut stopper = EarlyStoppingConfig::new().with_patience(1).init::<()>();
        for epoch in 0..5 {
            let signal = stopper.on_epoch_end(epoch, &history_with("loss", 1.0), &());
            assert_eq!(signal, Signal::Continue);
        }
    }

    #[test]
    fn learning_rate_halves_after_plateau_and_floors() {
        let mut scheduler = ReduceLrOnPlateauConfig::new().init();
        let mut lr = 1e-3;

        lr = scheduler.on_epoch_end(0, &history_with(VAL_LOSS, 1.0), lr);
        for epoch in 1..5 {
            lr = scheduler.on_epoch_end(epoch, &history_with(VAL_LOSS, 1.0), lr);
            assert_eq!(lr, 1e-3);
        }
        lr = scheduler.on_epoch_end(5, &history_with(VAL_LOSS, 1.0), lr);
        assert!((lr - 5e-4).abs() < 1e-15);

        for epoch in 6..200 {
            lr = scheduler.on_epoch_end(epoch, &history_with(VAL_LOSS, 1.0), lr);
            assert!(lr >= 1e-6);
        }
        assert_eq!(lr, 1e-6);
    }

    #[test]
    fn improvements_below_min_delta_count_as_plateau() {
        let mut scheduler = ReduceLrOnPlateauConfig::new().with_patience(2).init();
        let mut lr = 0.1;
        for (epoch, loss) in [1.0, 0.99995, 0.99992].into_iter().enumerate() {
            lr = scheduler.on_epoch_end(epoch, &history_with(VAL_LOSS, loss), lr);
        }
        assert!((lr - 0.05).abs() < 1e-12);
    }

    #[test]
    fn counting_resumes_on_last_cooldown_epoch() {
        let mut scheduler = ReduceLrOnPlateauConfig::new()
            .with_patience(1)
            .with_cooldown(2)
            .with_min_delta(0.0)
            .init();
        let mut lr = 1.0;
        let mut rates = Vec::new();
        for epoch in 0..5 {
            lr = scheduler.on_epoch_end(epoch, &history_with(VAL_LOSS, 1.0), lr);
            rates.push(lr);
        }
        assert_eq!(rates, vec![1.0, 0.5, 0.5, 0.25, 0.25]);
    }

    #[test]
    fn checkpoint_best_is_monotonic() {
        let mut checkpoint = CheckpointConfig::new().init();
        let accuracies = [0.4, 0.6, 0.55, 0.6, 0.7, 0.2, 0.71];

        let mut seen = Vec::new();
        let mut saved = Vec::new();
        for (epoch, &acc) in accuracies.iter().enumerate() {
            seen.push(acc);
            if checkpoint.on_epoch_end(epoch, &history_with(VAL_ACCURACY, acc)) {
                saved.push(epoch);
                let best = checkpoint.best().unwrap();
                assert!(seen.iter().all(|&previous| best >= previous));
            }
        }

        assert_eq!(saved, vec![0, 1, 4, 6]);
        assert_eq!(checkpoint.best(), Some(0.71));
        assert_eq!(checkpoint.best_epoch(), Some(6));
    }

    #[test]
    fn checkpoint_saves_every_epoch_when_not_best_only() {
        let mut checkpoint = CheckpointConfig::new().with_save_best_only(false).init();
        assert!(checkpoint.on_epoch_end(0, &history_with(VAL_ACCURACY, 0.9)));
        assert!(checkpoint.on_epoch_end(1, &history_with(VAL_ACCURACY, 0.1)));
    }
}
