use moldiff_core::EmaRate;
use tch::Tensor;

/// `target = target * rate + source * (1 - rate)`, in place and without autograd.
pub fn update_ema(targets: &[Tensor], sources: &[Tensor], rate: f64) {
    assert_eq!(
        targets.len(),
        sources.len(),
        "EMA shadow and source parameter lists differ in length"
    );
    let _guard = tch::no_grad_guard();
    for (target, source) in targets.iter().zip(sources) {
        let mut target = target.shallow_clone();
        let _ = target.g_mul_scalar_(rate);
        let _ = target.g_add_(&(source.detach().to_kind(target.kind()) * (1.0 - rate)));
    }
}

/// A smoothed copy of the master parameters for one decay rate.
#[derive(Debug)]
pub struct EmaShadow {
    pub rate: EmaRate,
    pub params: Vec<Tensor>,
}

impl EmaShadow {
    /// Starts the shadow as an independent copy of `params`.
    pub fn from_params(rate: EmaRate, params: &[Tensor]) -> Self {
        let _guard = tch::no_grad_guard();
        Self {
            rate,
            params: params.iter().map(|p| p.detach().copy()).collect(),
        }
    }

    pub fn update(&self, sources: &[Tensor]) {
        update_ema(&self.params, sources, self.rate.value());
    }
}
