use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

/// AdamW hyperparameters. The learning rate is supplied per step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamWConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug)]
struct ParamState {
    /// Exponential moving average of gradients
    exp_avg: Tensor,
    /// Exponential moving average of squared gradients
    exp_avg_sq: Tensor,
}

/// AdamW with decoupled weight decay over an explicit, ordered parameter list.
///
/// State is kept in fp32 and matched to parameters by position, so callers must
/// hand over parameters in the same order every step.
#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    states: Vec<ParamState>,
    step: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum OptimizerStateError {
    #[error("optimizer state is missing entry {0}")]
    MissingEntry(String),

    #[error("optimizer state entry {name} has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        got: Vec<i64>,
    },
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            states: Vec::new(),
            step: 0,
        }
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    fn init_states(&mut self, params: &[Tensor]) {
        if self.states.len() == params.len() {
            return;
        }
        self.states = params
            .iter()
            .map(|p| ParamState {
                exp_avg: Tensor::zeros(p.size(), (Kind::Float, p.device())),
                exp_avg_sq: Tensor::zeros(p.size(), (Kind::Float, p.device())),
            })
            .collect();
    }

    /// One update of every parameter from its paired gradient.
    pub fn step(&mut self, params: &[Tensor], grads: &[Tensor], lr: f64) {
        assert_eq!(params.len(), grads.len(), "every parameter needs a gradient");
        self.init_states(params);
        self.step += 1;

        let _guard = tch::no_grad_guard();
        let AdamWConfig {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);

        for ((param, grad), state) in params.iter().zip(grads).zip(self.states.iter_mut()) {
            let mut param = param.shallow_clone();
            let grad = grad.to_kind(Kind::Float);

            // θ = θ * (1 - wd * lr)
            if weight_decay > 0.0 {
                let _ = param.g_mul_scalar_(1.0 - weight_decay * lr);
            }

            // m_t = β1 * m_{t-1} + (1 - β1) * g_t
            let _ = state.exp_avg.g_mul_scalar_(beta1);
            let _ = state.exp_avg.g_add_(&(&grad * (1.0 - beta1)));

            // v_t = β2 * v_{t-1} + (1 - β2) * g_t^2
            let _ = state.exp_avg_sq.g_mul_scalar_(beta2);
            let _ = state.exp_avg_sq.g_add_(&(&grad * &grad * (1.0 - beta2)));

            let denom = (&state.exp_avg_sq / bias_correction2).sqrt() + eps;
            let update = (&state.exp_avg / bias_correction1) / denom;
            let _ = param.g_add_(&(update.to_kind(param.kind()) * (-lr)));
        }
    }

    /// Named tensors suitable for `Tensor::save_multi`.
    pub fn state_dict(&self) -> Vec<(String, Tensor)> {
        let mut entries = Vec::with_capacity(self.states.len() * 2 + 1);
        entries.push((
            "step".to_owned(),
            Tensor::from_slice(&[self.step as i64]),
        ));
        for (i, state) in self.states.iter().enumerate() {
            entries.push((format!("exp_avg.{i}"), state.exp_avg.shallow_clone()));
            entries.push((format!("exp_avg_sq.{i}"), state.exp_avg_sq.shallow_clone()));
        }
        entries
    }

    /// Restores state saved by [`AdamW::state_dict`] for `params`.
    pub fn load_state_dict(
        &mut self,
        entries: &[(String, Tensor)],
        params: &[Tensor],
    ) -> Result<(), OptimizerStateError> {
        let find = |name: &str| {
            entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t)
                .ok_or_else(|| OptimizerStateError::MissingEntry(name.to_owned()))
        };
        let step = find("step")?.to_device(Device::Cpu).int64_value(&[0]) as u64;
        // Saved before the first update: moments are created lazily on the next step.
        if !entries.iter().any(|(n, _)| n.starts_with("exp_avg.")) {
            self.step = step;
            self.states = Vec::new();
            return Ok(());
        }
        let states = params
            .iter()
            .enumerate()
            .map(|(i, param)| -> Result<ParamState, OptimizerStateError> {
                let load = |name: String| -> Result<Tensor, OptimizerStateError> {
                    let tensor = find(&name)?;
                    match tensor.size() == param.size() {
                        true => Ok(tensor.to_kind(Kind::Float).to_device(param.device())),
                        false => Err(OptimizerStateError::ShapeMismatch {
                            name,
                            expected: param.size(),
                            got: tensor.size(),
                        }),
                    }
                };
                Ok(ParamState {
                    exp_avg: load(format!("exp_avg.{i}"))?,
                    exp_avg_sq: load(format!("exp_avg_sq.{i}"))?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.step = step;
        self.states = states;
        Ok(())
    }
}
