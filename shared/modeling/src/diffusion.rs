use std::collections::BTreeMap;
use tch::{nn::VarStore, Kind, Tensor};

use crate::TensorDict;

/// Per-example loss terms keyed by name. Must include `"loss"`, the term that is
/// back-propagated.
pub type LossDict = BTreeMap<String, Tensor>;

pub const LOSS_KEY: &str = "loss";

/// A denoising network whose parameters live in a [`VarStore`].
pub trait DiffusionModel: Send {
    fn var_store(&self) -> &VarStore;

    fn var_store_mut(&mut self) -> &mut VarStore;

    /// Predicts from the noised input `x_t` at `timesteps`.
    fn forward(&self, x_t: &Tensor, timesteps: &Tensor, cond: Option<&TensorDict>) -> Tensor;

    /// Casts every parameter to the working precision used under mixed precision.
    fn convert_to_fp16(&mut self, kind: Kind) {
        self.var_store_mut().set_kind(kind);
    }
}

/// The noise process: owns the schedule and turns a clean batch into losses.
pub trait Diffusion: Send {
    fn num_timesteps(&self) -> usize;

    /// Per-example losses of `model` on `batch` noised to `timesteps`.
    ///
    /// `step` is the global training step, including any resumed steps.
    fn training_losses(
        &self,
        model: &dyn DiffusionModel,
        step: u64,
        timesteps: &Tensor,
        batch: &TensorDict,
        cond: Option<&TensorDict>,
    ) -> LossDict;
}
