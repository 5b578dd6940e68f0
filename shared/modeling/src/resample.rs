use rand::Rng;
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;

use crate::{CommunicatorError, DistributedContext};

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("unknown schedule sampler: {0}")]
    UnknownSampler(String),

    #[error("timestep {timestep} is outside a schedule of {num_timesteps} steps")]
    TimestepOutOfRange { timestep: i64, num_timesteps: usize },

    #[error("got {timesteps} timesteps but {losses} losses")]
    LengthMismatch { timesteps: usize, losses: usize },

    #[error("failed to gather losses: {0}")]
    Communicator(#[from] CommunicatorError),

    #[error("failed to encode losses: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("torch error: {0}")]
    Torch(#[from] TchError),
}

#[derive(Debug, Clone)]
pub struct UniformSampler {
    num_timesteps: usize,
}

impl UniformSampler {
    pub fn new(num_timesteps: usize) -> Self {
        assert!(num_timesteps > 0, "a schedule needs at least one timestep");
        Self { num_timesteps }
    }
}

/// Importance-samples timesteps by the root mean square of their recent losses.
///
/// Until every timestep has `history_per_term` recorded losses the sampler
/// behaves uniformly.
#[derive(Debug, Clone)]
pub struct LossSecondMomentResampler {
    num_timesteps: usize,
    history_per_term: usize,
    uniform_prob: f64,
    loss_history: Vec<Vec<f64>>,
    loss_counts: Vec<usize>,
}

impl LossSecondMomentResampler {
    pub const DEFAULT_HISTORY_PER_TERM: usize = 10;
    pub const DEFAULT_UNIFORM_PROB: f64 = 0.001;

    pub fn new(num_timesteps: usize) -> Self {
        Self::with_history(
            num_timesteps,
            Self::DEFAULT_HISTORY_PER_TERM,
            Self::DEFAULT_UNIFORM_PROB,
        )
    }

    pub fn with_history(num_timesteps: usize, history_per_term: usize, uniform_prob: f64) -> Self {
        assert!(num_timesteps > 0, "a schedule needs at least one timestep");
        assert!(history_per_term > 0, "history must hold at least one loss");
        Self {
            num_timesteps,
            history_per_term,
            uniform_prob,
            loss_history: vec![vec![0.0; history_per_term]; num_timesteps],
            loss_counts: vec![0; num_timesteps],
        }
    }

    pub fn warmed_up(&self) -> bool {
        self.loss_counts.iter().all(|&c| c == self.history_per_term)
    }

    fn weights(&self) -> Vec<f64> {
        if !self.warmed_up() {
            return vec![1.0; self.num_timesteps];
        }
        let rms = self
            .loss_history
            .iter()
            .map(|hist| (hist.iter().map(|l| l * l).sum::<f64>() / hist.len() as f64).sqrt())
            .collect::<Vec<_>>();
        let total: f64 = rms.iter().sum();
        let uniform = self.uniform_prob / self.num_timesteps as f64;
        rms.into_iter()
            .map(|w| w / total * (1.0 - self.uniform_prob) + uniform)
            .collect()
    }

    /// Records losses already gathered from every worker, in rank order.
    pub fn update_with_all_losses(
        &mut self,
        timesteps: &[i64],
        losses: &[f64],
    ) -> Result<(), SamplerError> {
        if timesteps.len() != losses.len() {
            return Err(SamplerError::LengthMismatch {
                timesteps: timesteps.len(),
                losses: losses.len(),
            });
        }
        for (&t, &loss) in timesteps.iter().zip(losses) {
            let index = usize::try_from(t)
                .ok()
                .filter(|&i| i < self.num_timesteps)
                .ok_or(SamplerError::TimestepOutOfRange {
                    timestep: t,
                    num_timesteps: self.num_timesteps,
                })?;
            let count = &mut self.loss_counts[index];
            let history = &mut self.loss_history[index];
            if *count == self.history_per_term {
                history.rotate_left(1);
                history[self.history_per_term - 1] = loss;
            } else {
                history[*count] = loss;
                *count += 1;
            }
        }
        Ok(())
    }

    /// Shares this worker's `(timestep, loss)` pairs with every worker, then
    /// records the combined set so all samplers stay identical.
    pub fn update_with_local_losses(
        &mut self,
        ctx: &DistributedContext,
        timesteps: &Tensor,
        losses: &Tensor,
    ) -> Result<(), SamplerError> {
        let local_t = Vec::<i64>::try_from(
            &timesteps
                .to_kind(Kind::Int64)
                .flatten(0, -1)
                .to_device(Device::Cpu),
        )?;
        let local_l = Vec::<f64>::try_from(
            &losses
                .detach()
                .to_kind(Kind::Double)
                .flatten(0, -1)
                .to_device(Device::Cpu),
        )?;
        let payload = serde_json::to_vec(&LossRecord {
            timesteps: local_t,
            losses: local_l,
        })?;

        let mut all_t = Vec::new();
        let mut all_l = Vec::new();
        for bytes in ctx.communicator.all_gather_bytes(&payload)? {
            let record: LossRecord = serde_json::from_slice(&bytes)?;
            all_t.extend(record.timesteps);
            all_l.extend(record.losses);
        }
        self.update_with_all_losses(&all_t, &all_l)
    }
}

#[derive(Serialize, Deserialize)]
struct LossRecord {
    timesteps: Vec<i64>,
    losses: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum ScheduleSampler {
    Uniform(UniformSampler),
    LossSecondMoment(LossSecondMomentResampler),
}

impl ScheduleSampler {
    pub fn num_timesteps(&self) -> usize {
        match self {
            ScheduleSampler::Uniform(s) => s.num_timesteps,
            ScheduleSampler::LossSecondMoment(s) => s.num_timesteps,
        }
    }

    /// Unnormalised sampling weight of each timestep.
    pub fn weights(&self) -> Vec<f64> {
        match self {
            ScheduleSampler::Uniform(s) => vec![1.0; s.num_timesteps],
            ScheduleSampler::LossSecondMoment(s) => s.weights(),
        }
    }

    /// Draws `batch_size` timesteps with probability `w / Σw` and returns them
    /// with importance weights `1 / (T · p[t])`, so a weighted mean of per-example
    /// losses is an unbiased estimate of the uniform-timestep objective.
    pub fn sample(&self, batch_size: usize, device: Device, rng: &mut impl Rng) -> (Tensor, Tensor) {
        let weights = self.weights();
        let total: f64 = weights.iter().sum();
        let probs = weights.iter().map(|w| w / total).collect::<Vec<_>>();
        let cumulative = probs
            .iter()
            .scan(0.0, |acc, p| {
                *acc += p;
                Some(*acc)
            })
            .collect::<Vec<_>>();
        let last = probs.len() - 1;

        let num_timesteps = probs.len() as f64;
        let (indices, importance): (Vec<i64>, Vec<f32>) = (0..batch_size)
            .map(|_| {
                let u: f64 = rng.random();
                let index = cumulative.partition_point(|&c| c <= u).min(last);
                (index as i64, (1.0 / (num_timesteps * probs[index])) as f32)
            })
            .unzip();

        (
            Tensor::from_slice(&indices).to_device(device),
            Tensor::from_slice(&importance).to_device(device),
        )
    }

    /// `Some` for samplers that adapt to observed losses.
    pub fn loss_aware_mut(&mut self) -> Option<&mut LossSecondMomentResampler> {
        match self {
            ScheduleSampler::Uniform(_) => None,
            ScheduleSampler::LossSecondMoment(s) => Some(s),
        }
    }
}

/// Builds a sampler by the name used in configuration files.
pub fn create_named_schedule_sampler(
    name: &str,
    num_timesteps: usize,
) -> Result<ScheduleSampler, SamplerError> {
    match name {
        "uniform" => Ok(ScheduleSampler::Uniform(UniformSampler::new(num_timesteps))),
        "loss-second-moment" => Ok(ScheduleSampler::LossSecondMoment(
            LossSecondMomentResampler::new(num_timesteps),
        )),
        other => Err(SamplerError::UnknownSampler(other.to_owned())),
    }
}
