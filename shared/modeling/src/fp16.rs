//! Mixed-precision bookkeeping.
//!
//! Under mixed precision the model trains in a reduced-precision kind while the
//! optimizer works on a single flattened fp32 copy of every parameter (the
//! master copy). Gradients flow model → master, updates flow master → model.
//! All functions take parameters in the stable name order of
//! [`crate::named_parameters`].

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkingKind {
    Half,
    BFloat16,
}

impl From<WorkingKind> for Kind {
    fn from(value: WorkingKind) -> Self {
        match value {
            WorkingKind::Half => Kind::Half,
            WorkingKind::BFloat16 => Kind::BFloat16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Precision {
    #[default]
    Full,
    Mixed { kind: WorkingKind },
}

impl Precision {
    pub fn is_mixed(&self) -> bool {
        matches!(self, Precision::Mixed { .. })
    }
}

/// The parameters the optimizer and EMA shadows operate on.
#[derive(Debug)]
pub enum MasterParams {
    /// Handles aliasing the model's own tensors. Nothing is copied.
    Full(Vec<Tensor>),
    /// One owned fp32 vector holding every parameter, plus its gradient buffer.
    Mixed { flat: Tensor, grad: Tensor },
}

impl MasterParams {
    /// The tensors an optimizer steps, in order.
    pub fn tensors(&self) -> Vec<Tensor> {
        match self {
            MasterParams::Full(params) => params.iter().map(|p| p.shallow_clone()).collect(),
            MasterParams::Mixed { flat, .. } => vec![flat.shallow_clone()],
        }
    }

    /// Gradients matching [`MasterParams::tensors`]. Undefined model gradients
    /// are returned as zeros.
    pub fn grads(&self) -> Vec<Tensor> {
        match self {
            MasterParams::Full(params) => params
                .iter()
                .map(|p| match p.grad() {
                    grad if grad.defined() => grad,
                    _ => p.zeros_like(),
                })
                .collect(),
            MasterParams::Mixed { grad, .. } => vec![grad.shallow_clone()],
        }
    }
}

fn flatten(tensors: impl Iterator<Item = Tensor>) -> Tensor {
    let flat = tensors
        .map(|t| t.to_kind(Kind::Float).flatten(0, -1))
        .collect::<Vec<_>>();
    Tensor::cat(&flat, 0)
}

/// Copies `params` into one fp32 vector with a zeroed gradient buffer.
pub fn make_master_params(params: &[Tensor]) -> MasterParams {
    let _guard = tch::no_grad_guard();
    let flat = flatten(params.iter().map(|p| p.detach()));
    let grad = flat.zeros_like();
    MasterParams::Mixed { flat, grad }
}

/// Writes the model's gradients, flattened and in fp32, into the master gradient.
pub fn model_grads_to_master_grads(model_params: &[Tensor], master: &MasterParams) {
    let MasterParams::Mixed { grad, .. } = master else {
        return;
    };
    let _guard = tch::no_grad_guard();
    let flat = flatten(model_params.iter().map(|p| match p.grad() {
        g if g.defined() => g,
        _ => p.zeros_like(),
    }));
    grad.shallow_clone().copy_(&flat);
}

/// Copies master values back into the model, casting to each parameter's kind.
pub fn master_params_to_model_params(model_params: &[Tensor], master: &MasterParams) {
    let MasterParams::Mixed { flat, .. } = master else {
        return;
    };
    let _guard = tch::no_grad_guard();
    for (param, value) in model_params
        .iter()
        .zip(unflatten_master_params(model_params, flat))
    {
        param.shallow_clone().copy_(&value);
    }
}

/// Splits a flat master tensor into views shaped like `model_params`.
pub fn unflatten_master_params(model_params: &[Tensor], flat: &Tensor) -> Vec<Tensor> {
    let sizes = model_params.iter().map(|p| p.numel() as i64).collect::<Vec<_>>();
    flat.split_with_sizes(sizes.as_slice(), 0)
        .into_iter()
        .zip(model_params)
        .map(|(chunk, param)| chunk.view(param.size().as_slice()))
        .collect()
}

pub fn zero_grad(params: &[Tensor]) {
    let _guard = tch::no_grad_guard();
    for param in params {
        let mut grad = param.grad();
        if grad.defined() {
            let _ = grad.zero_();
        }
    }
}

pub fn zero_master_grad(master: &MasterParams) {
    match master {
        MasterParams::Full(params) => zero_grad(params),
        MasterParams::Mixed { grad, .. } => {
            let _ = grad.shallow_clone().zero_();
        }
    }
}

/// Multiplies every tensor in place by `scale`.
pub fn unscale(tensors: &[Tensor], scale: f64) {
    let _guard = tch::no_grad_guard();
    for tensor in tensors {
        let _ = tensor.shallow_clone().g_mul_scalar_(scale);
    }
}

/// False if any defined gradient holds an infinity or NaN.
pub fn grads_are_finite(params: &[Tensor]) -> bool {
    let _guard = tch::no_grad_guard();
    params.iter().all(|p| {
        let grad = p.grad();
        !grad.defined()
            || grad
                .to_kind(Kind::Double)
                .sum(Kind::Double)
                .double_value(&[])
                .is_finite()
    })
}

/// L2 norm over every tensor, accumulated in f64.
pub fn global_norm(tensors: &[Tensor]) -> f64 {
    let _guard = tch::no_grad_guard();
    tensors
        .iter()
        .map(|t| {
            t.to_kind(Kind::Double)
                .square()
                .sum(Kind::Double)
                .double_value(&[])
        })
        .sum::<f64>()
        .sqrt()
}

/// Rescales `grads` so their joint norm is at most `max_norm`. Returns the norm
/// before clipping.
pub fn clip_grad_norm(grads: &[Tensor], max_norm: f64) -> f64 {
    let norm = global_norm(grads);
    if norm > max_norm {
        unscale(grads, max_norm / (norm + 1e-6));
    }
    norm
}
