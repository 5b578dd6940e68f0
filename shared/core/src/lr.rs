use serde::{Deserialize, Serialize};

pub trait LearningRateScheduler {
    fn get_lr(&self, step: u64) -> f64;
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ConstantLR {
    base_lr: f64,
}

impl ConstantLR {
    pub fn new(base_lr: f64) -> Self {
        Self { base_lr }
    }
}

impl Default for ConstantLR {
    fn default() -> Self {
        Self { base_lr: 1.0e-4 }
    }
}

impl LearningRateScheduler for ConstantLR {
    fn get_lr(&self, _step: u64) -> f64 {
        self.base_lr
    }
}

/// Linear warmup from zero to `base_lr`, then linear decay to zero at `total_steps`.
///
/// Without a warmup the rate starts at `base_lr` and decays over the whole budget.
/// The result is always clamped to `[0, base_lr]`, so steps past the budget yield zero.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LinearAnnealLR {
    base_lr: f64,
    total_steps: u64,
    warmup_steps: u64,
}

impl LinearAnnealLR {
    pub fn new(base_lr: f64, total_steps: u64, warmup_steps: u64) -> Self {
        assert!(total_steps > 0, "annealing needs a non-zero step budget");
        Self {
            base_lr,
            total_steps,
            warmup_steps,
        }
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }
}

impl LearningRateScheduler for LinearAnnealLR {
    fn get_lr(&self, step: u64) -> f64 {
        let step = step as f64;
        let total = self.total_steps as f64;
        let factor = match self.warmup_steps {
            0 => 1.0 - step / total,
            warmup => {
                let warmup = warmup as f64;
                let warmup_frac = step / warmup;
                let frac_done = match total > warmup {
                    true => (step - warmup) / (total - warmup),
                    false => 0.0,
                };
                warmup_frac.min(1.0) * (1.0 - frac_done).min(1.0)
            }
        };
        (self.base_lr * factor).min(self.base_lr).max(0.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum LearningRateSchedule {
    Constant(ConstantLR),
    LinearAnneal(LinearAnnealLR),
}

impl LearningRateSchedule {
    /// `anneal_steps == 0` means an unbounded run at a constant rate.
    pub fn from_budget(base_lr: f64, anneal_steps: u64, warmup_steps: Option<u64>) -> Self {
        match anneal_steps {
            0 => Self::Constant(ConstantLR::new(base_lr)),
            total => Self::LinearAnneal(LinearAnnealLR::new(
                base_lr,
                total,
                warmup_steps.unwrap_or(0),
            )),
        }
    }

    pub fn total_steps(&self) -> Option<u64> {
        match self {
            Self::Constant(_) => None,
            Self::LinearAnneal(anneal) => Some(anneal.total_steps()),
        }
    }
}

impl LearningRateScheduler for LearningRateSchedule {
    fn get_lr(&self, step: u64) -> f64 {
        match self {
            Self::Constant(constant) => constant.get_lr(step),
            Self::LinearAnneal(anneal) => anneal.get_lr(step),
        }
    }
}
