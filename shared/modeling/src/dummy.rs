use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashSet;
use tch::{
    nn::{Init, VarStore},
    Device, Kind, Tensor,
};

use crate::{
    batch::INPUT_IDS, DataItem, Diffusion, DiffusionModel, LossDict, TensorDict, LOSS_KEY,
};

/// A denoiser with one scale, shift and timestep gain per sequence position.
///
/// Elementwise only, so it runs in half precision on any device.
#[derive(Debug)]
pub struct DummyDenoiser {
    var_store: VarStore,
    scale: Tensor,
    shift: Tensor,
    time_gain: Tensor,
    num_timesteps: usize,
}

impl DummyDenoiser {
    pub fn new(seq_len: i64, num_timesteps: usize, device: Device) -> Self {
        let var_store = VarStore::new(device);
        let root = var_store.root();
        let scale = root.var("denoiser.scale", &[seq_len], Init::Const(1.0));
        let shift = root.var("denoiser.shift", &[seq_len], Init::Const(0.0));
        let time_gain = root.var("time_embed.gain", &[seq_len], Init::Const(0.1));
        Self {
            var_store,
            scale,
            shift,
            time_gain,
            num_timesteps,
        }
    }
}

impl DiffusionModel for DummyDenoiser {
    fn var_store(&self) -> &VarStore {
        &self.var_store
    }

    fn var_store_mut(&mut self) -> &mut VarStore {
        &mut self.var_store
    }

    fn forward(&self, x_t: &Tensor, timesteps: &Tensor, _cond: Option<&TensorDict>) -> Tensor {
        let kind = self.scale.kind();
        let t = (timesteps.to_kind(kind) / self.num_timesteps as f64).unsqueeze(-1);
        x_t.to_kind(kind) * &self.scale + &self.shift + t * &self.time_gain
    }
}

/// A closed-form noise process over normalised token ids.
///
/// The noise is a deterministic function of the inputs and timestep, so losses
/// do not depend on the global torch RNG.
#[derive(Debug, Clone)]
pub struct DummyDiffusion {
    num_timesteps: usize,
    vocab_size: i64,
    nan_at_steps: HashSet<u64>,
}

impl DummyDiffusion {
    pub fn new(num_timesteps: usize, vocab_size: i64) -> Self {
        Self {
            num_timesteps,
            vocab_size,
            nan_at_steps: HashSet::new(),
        }
    }

    /// Makes every loss NaN at the given trainer steps.
    pub fn with_nan_at_steps(mut self, steps: impl IntoIterator<Item = u64>) -> Self {
        self.nan_at_steps = steps.into_iter().collect();
        self
    }
}

impl Diffusion for DummyDiffusion {
    fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    fn training_losses(
        &self,
        model: &dyn DiffusionModel,
        step: u64,
        timesteps: &Tensor,
        batch: &TensorDict,
        cond: Option<&TensorDict>,
    ) -> LossDict {
        let Some(input_ids) = batch.get(INPUT_IDS) else {
            return LossDict::new();
        };
        let x0 = input_ids.to_kind(Kind::Float) / self.vocab_size as f64;
        let t = timesteps.to_kind(Kind::Float).unsqueeze(-1);
        let noise = (&x0 * 7.0 + &t * 0.37).sin();
        // fraction of the signal replaced by noise, reaching 1 at the last step
        let noised = (&t + 1.0) / self.num_timesteps as f64;
        let alpha = -&noised + 1.0;
        let x_t = alpha.sqrt() * &x0 + noised.sqrt() * &noise;

        let predicted = model.forward(&x_t, timesteps, cond).to_kind(Kind::Float);
        let mut mse = (predicted - noise).square().mean_dim(-1, false, Kind::Float);
        if self.nan_at_steps.contains(&step) {
            mse = mse * f64::NAN;
        }

        let mut losses = LossDict::new();
        losses.insert("mse".to_owned(), mse.shallow_clone());
        losses.insert(LOSS_KEY.to_owned(), mse);
        losses
    }
}

/// Endless batches of random token ids, reproducible from `seed`.
pub fn synthetic_batches(
    batch_size: i64,
    seq_len: i64,
    vocab_size: i64,
    seed: u64,
) -> impl Iterator<Item = DataItem> + Send {
    let mut rng = StdRng::seed_from_u64(seed);
    std::iter::repeat_with(move || {
        let ids = (0..batch_size * seq_len)
            .map(|_| rng.random_range(0..vocab_size))
            .collect::<Vec<_>>();
        let mut batch = TensorDict::new();
        batch.insert(
            INPUT_IDS,
            Tensor::from_slice(&ids).reshape([batch_size, seq_len]),
        );
        (batch, None)
    })
}
