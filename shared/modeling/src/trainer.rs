use moldiff_core::{
    ema_checkpoint_filename, find_ema_checkpoint, find_latest_checkpoint,
    model_checkpoint_filename, optimizer_checkpoint_filename, optimizer_checkpoint_path,
    parse_ema_rates, parse_resume_step_from_filename, EmaRate, LearningRateSchedule,
    LearningRateScheduler, RunEnvironment,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    checkpoint::{copy_state_dict_into, load_state_dict, save_state_dict},
    create_named_schedule_sampler,
    fp16::{
        global_norm, grads_are_finite, make_master_params, master_params_to_model_params,
        model_grads_to_master_grads, unflatten_master_params, unscale, zero_grad, zero_master_grad,
        MasterParams,
    },
    named_parameters, sync_params, AdamW, AdamWConfig, AllReduce, CheckpointError,
    CommunicatorError, DataItem, Diffusion, DiffusionModel, DistributedContext, EmaShadow,
    LoggerError, LossDict, MetricsLogger, Precision, ReduceType, SamplerError, ScheduleSampler,
    TensorDict, LOSS_KEY,
};

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("batch has no input_ids entry")]
    MissingInputIds,

    #[error("diffusion losses have no \"loss\" entry")]
    MissingLoss,

    #[error("training data source is exhausted")]
    DataExhausted,

    #[error("learning rate must be finite and non-negative, got {0}")]
    InvalidLearningRate(f64),

    #[error("failed to scan checkpoint directory {path}: {source}")]
    CheckpointScan {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("communicator error: {0}")]
    Communicator(#[from] CommunicatorError),

    #[error("schedule sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("metrics error: {0}")]
    Logger(#[from] LoggerError),

    #[error("torch error: {0}")]
    Torch(#[from] TchError),
}

fn default_ema_rates() -> Vec<EmaRate> {
    EmaRate::new(0.9999).into_iter().collect()
}

/// Accepts `"0.9999,0.999"`, `[0.9999, 0.999]` or a single number.
fn ema_rates_from_str_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<EmaRate>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        List(Vec<EmaRate>),
        Single(EmaRate),
    }
    match Raw::deserialize(d)? {
        Raw::Joined(s) => parse_ema_rates(&s).map_err(serde::de::Error::custom),
        Raw::List(rates) => Ok(rates),
        Raw::Single(rate) => Ok(vec![rate]),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Examples per worker per step.
    pub batch_size: usize,
    /// Examples per forward/backward pass. 0 uses the whole batch.
    pub microbatch: usize,
    pub lr: f64,
    #[serde(deserialize_with = "ema_rates_from_str_or_list")]
    pub ema_rate: Vec<EmaRate>,
    pub log_interval: u64,
    pub save_interval: u64,
    /// 0 disables evaluation.
    pub eval_interval: u64,
    pub resume_checkpoint: Option<PathBuf>,
    /// Resume from the newest `modelNNNNNN.pt` in the checkpoint directory.
    pub auto_resume: bool,
    pub precision: Precision,
    pub fp16_scale_growth: f64,
    pub initial_lg_loss_scale: f64,
    pub schedule_sampler: String,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_eps: f64,
    /// Total step budget. 0 trains at a constant rate until the data runs out.
    pub lr_anneal_steps: u64,
    pub warmup_steps: u64,
    /// Maximum global gradient norm. 0 or less disables clipping.
    pub gradient_clipping: f64,
    pub checkpoint_path: PathBuf,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        let adam = AdamWConfig::default();
        Self {
            batch_size: 1,
            microbatch: 0,
            lr: 1e-4,
            ema_rate: default_ema_rates(),
            log_interval: 10,
            save_interval: 10_000,
            eval_interval: 0,
            resume_checkpoint: None,
            auto_resume: false,
            precision: Precision::Full,
            fp16_scale_growth: 1e-3,
            initial_lg_loss_scale: 20.0,
            schedule_sampler: "uniform".to_owned(),
            weight_decay: adam.weight_decay,
            adam_beta1: adam.beta1,
            adam_beta2: adam.beta2,
            adam_eps: adam.eps,
            lr_anneal_steps: 0,
            warmup_steps: 0,
            gradient_clipping: 0.0,
            checkpoint_path: PathBuf::from("checkpoints"),
            seed: 0,
        }
    }
}

impl TrainerConfig {
    pub fn adamw(&self) -> AdamWConfig {
        AdamWConfig {
            beta1: self.adam_beta1,
            beta2: self.adam_beta2,
            eps: self.adam_eps,
            weight_decay: self.weight_decay,
        }
    }

    pub fn lr_schedule(&self) -> LearningRateSchedule {
        LearningRateSchedule::from_budget(self.lr, self.lr_anneal_steps, Some(self.warmup_steps))
    }
}

/// Counters that advance once per iteration and never roll back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    /// Iterations completed by this process.
    pub step: u64,
    /// Step recovered from the resume checkpoint's filename.
    pub resume_step: u64,
    /// log2 of the loss scale used under mixed precision.
    pub lg_loss_scale: f64,
    /// Examples per step across all workers.
    pub global_batch: usize,
}

impl TrainingState {
    pub fn global_step(&self) -> u64 {
        self.step + self.resume_step
    }
}

type DataSource = Box<dyn Iterator<Item = DataItem>>;

pub struct Trainer {
    config: TrainerConfig,
    model: Box<dyn DiffusionModel>,
    diffusion: Box<dyn Diffusion>,
    data: DataSource,
    eval_data: Option<DataSource>,
    ctx: DistributedContext,
    logger: MetricsLogger,
    env: RunEnvironment,
    sampler: ScheduleSampler,
    param_names: Vec<String>,
    model_params: Vec<Tensor>,
    master: MasterParams,
    ema: Vec<EmaShadow>,
    opt: AdamW,
    lr_schedule: LearningRateSchedule,
    state: TrainingState,
    checkpoint_dir: PathBuf,
    last_saved_step: Option<u64>,
}

impl Trainer {
    /// Builds a trainer, restoring model, optimizer and EMA state when a resume
    /// checkpoint is configured or discovered.
    ///
    /// On failure, peers blocked in a collective are released with an error.
    pub fn new(
        config: TrainerConfig,
        model: Box<dyn DiffusionModel>,
        diffusion: Box<dyn Diffusion>,
        data: impl Iterator<Item = DataItem> + 'static,
        ctx: DistributedContext,
        logger: MetricsLogger,
        env: RunEnvironment,
    ) -> Result<Self, TrainerError> {
        let communicator = ctx.communicator.clone();
        let result = Self::restore(
            config,
            model,
            diffusion,
            Box::new(data),
            ctx,
            logger,
            env,
        );
        if let Err(err) = &result {
            if !communicator.is_cancelled() {
                warn!("trainer construction failed, releasing peers: {err}");
                communicator.cancel();
            }
        }
        result
    }

    fn restore(
        config: TrainerConfig,
        mut model: Box<dyn DiffusionModel>,
        diffusion: Box<dyn Diffusion>,
        data: DataSource,
        ctx: DistributedContext,
        logger: MetricsLogger,
        env: RunEnvironment,
    ) -> Result<Self, TrainerError> {
        if !config.lr.is_finite() || config.lr < 0.0 {
            return Err(TrainerError::InvalidLearningRate(config.lr));
        }
        if ctx.is_distributed() && !matches!(ctx.device, Device::Cuda(_)) {
            warn!(
                world_size = ctx.world_size,
                "Distributed training without CUDA: collectives run on the host and will be slow"
            );
        }

        let checkpoint_dir = env.checkpoint_dir(&config.checkpoint_path);
        let resume_checkpoint = match config.auto_resume {
            true => find_latest_checkpoint(&checkpoint_dir)
                .map_err(|source| TrainerError::CheckpointScan {
                    path: checkpoint_dir.clone(),
                    source,
                })?
                .or_else(|| config.resume_checkpoint.clone()),
            false => config.resume_checkpoint.clone(),
        };
        let resume_step = resume_checkpoint
            .as_deref()
            .map(parse_resume_step_from_filename)
            .unwrap_or(0);

        let named = named_parameters(model.var_store());
        if let Some(path) = &resume_checkpoint {
            if ctx.is_main() {
                info!(path = %path.display(), resume_step, "loading model from checkpoint");
                copy_state_dict_into(&named, load_state_dict(path, ctx.device)?)?;
            }
        }
        let (param_names, params): (Vec<_>, Vec<_>) = named.into_iter().unzip();
        sync_params(&params, &ctx.communicator)?;

        let master = match config.precision {
            Precision::Full => MasterParams::Full(params.iter().map(|p| p.shallow_clone()).collect()),
            Precision::Mixed { kind } => {
                let master = make_master_params(&params);
                model.convert_to_fp16(kind.into());
                master
            }
        };
        let model_params = named_parameters(model.var_store())
            .into_iter()
            .map(|(_, t)| t)
            .collect::<Vec<_>>();

        let mut opt = AdamW::new(config.adamw());
        if let Some(path) = &resume_checkpoint {
            let opt_path = optimizer_checkpoint_path(path, resume_step);
            if opt_path.is_file() {
                info!(path = %opt_path.display(), "loading optimizer state from checkpoint");
                let entries = load_state_dict(&opt_path, ctx.device)?;
                opt.load_state_dict(&entries, &master.tensors())
                    .map_err(CheckpointError::from)?;
            }
        }

        let mut trainer = Self {
            sampler: create_named_schedule_sampler(
                &config.schedule_sampler,
                diffusion.num_timesteps(),
            )?,
            lr_schedule: config.lr_schedule(),
            state: TrainingState {
                step: 0,
                resume_step,
                lg_loss_scale: config.initial_lg_loss_scale,
                global_batch: config.batch_size * ctx.world_size,
            },
            config,
            model,
            diffusion,
            data,
            eval_data: None,
            ctx,
            logger,
            env,
            param_names,
            model_params,
            master,
            ema: Vec::new(),
            opt,
            checkpoint_dir,
            last_saved_step: None,
        };
        trainer.ema = trainer
            .config
            .ema_rate
            .clone()
            .into_iter()
            .map(|rate| trainer.load_ema(rate, resume_checkpoint.as_deref()))
            .collect::<Result<_, _>>()?;
        Ok(trainer)
    }

    /// Batches for periodic evaluation, used every `eval_interval` steps.
    pub fn with_eval_data(mut self, eval_data: impl Iterator<Item = DataItem> + 'static) -> Self {
        self.eval_data = Some(Box::new(eval_data));
        self
    }

    fn load_ema(&self, rate: EmaRate, resume: Option<&Path>) -> Result<EmaShadow, TrainerError> {
        let shadow = EmaShadow::from_params(rate, &self.master.tensors());
        let found = resume.and_then(|main| find_ema_checkpoint(main, self.state.resume_step, rate));
        if let Some(path) = found {
            if self.ctx.is_main() {
                info!(path = %path.display(), %rate, "loading EMA from checkpoint");
                let views = self.named_views(&shadow.params);
                copy_state_dict_into(&views, load_state_dict(&path, self.ctx.device)?)?;
            }
        }
        sync_params(&shadow.params, &self.ctx.communicator)?;
        Ok(shadow)
    }

    /// Per-parameter views of a master-shaped tensor list, named like the model.
    fn named_views(&self, tensors: &[Tensor]) -> Vec<(String, Tensor)> {
        let views = match &self.master {
            MasterParams::Full(_) => tensors.iter().map(|t| t.shallow_clone()).collect(),
            MasterParams::Mixed { .. } => unflatten_master_params(&self.model_params, &tensors[0]),
        };
        self.param_names.iter().cloned().zip(views).collect()
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &dyn DiffusionModel {
        self.model.as_ref()
    }

    pub fn ema(&self) -> &[EmaShadow] {
        &self.ema
    }

    pub fn master_params(&self) -> &MasterParams {
        &self.master
    }

    pub fn optimizer_steps(&self) -> u64 {
        self.opt.steps_taken()
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn logger(&self) -> &MetricsLogger {
        &self.logger
    }

    /// Trains until the step budget is spent, or in smoke-test mode until the
    /// first checkpoint is written.
    ///
    /// On failure, peers blocked in a collective are released with an error.
    pub fn run_loop(&mut self) -> Result<(), TrainerError> {
        let result = self.run_loop_inner();
        if let Err(err) = &result {
            if !self.ctx.communicator.is_cancelled() {
                warn!(rank = self.ctx.rank, "training failed, releasing peers: {err}");
                self.ctx.communicator.cancel();
            }
        }
        result
    }

    fn budget_spent(&self) -> bool {
        self.config.lr_anneal_steps > 0 && self.state.global_step() >= self.config.lr_anneal_steps
    }

    fn run_loop_inner(&mut self) -> Result<(), TrainerError> {
        while !self.budget_spent() {
            let Some((batch, cond)) = self.data.next() else {
                return Err(TrainerError::DataExhausted);
            };
            self.run_step(&batch, cond.as_ref())?;
            self.state.step += 1;
            let global_step = self.state.global_step();

            if global_step % self.config.log_interval.max(1) == 0 {
                self.logger.dumpkvs(&self.ctx)?;
            }
            if self.config.eval_interval > 0 && global_step % self.config.eval_interval == 0 {
                self.run_eval()?;
            }
            if global_step % self.config.save_interval.max(1) == 0 {
                self.save()?;
                if self.env.training_test {
                    info!(global_step, "smoke test finished after first checkpoint");
                    return Ok(());
                }
            }
        }
        if self.last_saved_step != Some(self.state.global_step()) {
            self.save()?;
        }
        Ok(())
    }

    /// Evaluates only when every worker has a batch, so the metric flush stays
    /// paired across workers. Evaluation stops everywhere once any source runs dry.
    fn run_eval(&mut self) -> Result<(), TrainerError> {
        let item = self.eval_data.as_mut().and_then(|data| data.next());
        let mut ready = [if item.is_some() { 1.0 } else { 0.0 }];
        self.ctx
            .communicator
            .all_reduce(&mut ready, ReduceType::Sum)?;
        let ready = ready[0] as usize;
        match item {
            Some((batch, cond)) if ready == self.ctx.world_size => {
                self.forward_only(&batch, cond.as_ref())?;
                self.logger.dumpkvs(&self.ctx)?;
            }
            _ => {
                if self.eval_data.take().is_some() {
                    warn!(
                        ready,
                        world_size = self.ctx.world_size,
                        "evaluation data exhausted, disabling evaluation"
                    );
                }
            }
        }
        Ok(())
    }

    /// One forward/backward over `batch` followed by an optimizer step. Returns
    /// false when the step was skipped because of non-finite gradients.
    pub fn run_step(&mut self, batch: &TensorDict, cond: Option<&TensorDict>) -> Result<bool, TrainerError> {
        self.forward_backward(batch, cond)?;
        let stepped = match self.config.precision {
            Precision::Mixed { .. } => self.optimize_mixed(),
            Precision::Full => {
                self.optimize_full();
                true
            }
        };
        self.log_step();
        Ok(stepped)
    }

    fn step_seed(&self, stream: u64) -> u64 {
        self.config.seed
            ^ self
                .state
                .global_step()
                .wrapping_add(1)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (self.ctx.rank as u64 + 1).wrapping_mul(0xBF58_476D_1CE4_E5B9)
            ^ stream.wrapping_mul(0x94D0_49BB_1331_11EB)
    }

    fn microbatch_size(&self, batch_size: usize) -> usize {
        let size = match self.config.microbatch {
            0 => batch_size,
            micro => micro.min(batch_size),
        };
        size.max(1)
    }

    fn forward_backward(&mut self, batch: &TensorDict, cond: Option<&TensorDict>) -> Result<(), TrainerError> {
        zero_grad(&self.model_params);
        if self.config.precision.is_mixed() {
            zero_master_grad(&self.master);
        }
        let batch_size = batch.batch_size().ok_or(TrainerError::MissingInputIds)?;
        let micro_size = self.microbatch_size(batch_size);
        let seed = self.step_seed(0);
        let mut rng = StdRng::seed_from_u64(seed);
        tch::manual_seed(seed as i64);
        let device = self.ctx.device;
        let loss_scale = match self.config.precision {
            Precision::Mixed { .. } => Some(2f64.powf(self.state.lg_loss_scale)),
            Precision::Full => None,
        };

        for start in (0..batch_size).step_by(micro_size) {
            let micro = batch.slice_to(start, micro_size, device);
            let micro_cond = cond.map(|c| c.slice_to(start, micro_size, device));
            let rows = micro.batch_size().ok_or(TrainerError::MissingInputIds)?;
            let (t, weights) = self.sampler.sample(rows, device, &mut rng);

            let losses = self.diffusion.training_losses(
                self.model.as_ref(),
                self.state.global_step(),
                &t,
                &micro,
                micro_cond.as_ref(),
            );
            let raw = losses.get(LOSS_KEY).ok_or(TrainerError::MissingLoss)?;
            if let Some(sampler) = self.sampler.loss_aware_mut() {
                sampler.update_with_local_losses(&self.ctx, &t, &raw.detach())?;
            }

            let loss = (raw * &weights).mean(Kind::Float);
            self.log_loss_dict("", &t, &losses, &weights)?;
            trace!(start, rows, loss = loss.double_value(&[]), "microbatch");
            match loss_scale {
                Some(scale) => (loss * scale).backward(),
                None => loss.backward(),
            }
        }

        // gradients are combined once per batch, after the last microbatch
        if self.ctx.is_distributed() {
            let mut grads = self
                .model_params
                .iter()
                .map(|p| p.grad())
                .filter(|g| g.defined())
                .collect::<Vec<_>>();
            grads
                .as_mut_slice()
                .all_reduce(&self.ctx.communicator, ReduceType::Mean)?;
        }
        Ok(())
    }

    /// Evaluation losses under `eval_` keys. No gradients are computed.
    pub fn forward_only(&mut self, batch: &TensorDict, cond: Option<&TensorDict>) -> Result<(), TrainerError> {
        let _guard = tch::no_grad_guard();
        let batch_size = batch.batch_size().ok_or(TrainerError::MissingInputIds)?;
        let micro_size = self.microbatch_size(batch_size);
        let mut rng = StdRng::seed_from_u64(self.step_seed(1));
        let device = self.ctx.device;

        for start in (0..batch_size).step_by(micro_size) {
            let micro = batch.slice_to(start, micro_size, device);
            let micro_cond = cond.map(|c| c.slice_to(start, micro_size, device));
            let rows = micro.batch_size().ok_or(TrainerError::MissingInputIds)?;
            let (t, weights) = self.sampler.sample(rows, device, &mut rng);
            let losses = self.diffusion.training_losses(
                self.model.as_ref(),
                self.state.global_step(),
                &t,
                &micro,
                micro_cond.as_ref(),
            );
            if !losses.contains_key(LOSS_KEY) {
                return Err(TrainerError::MissingLoss);
            }
            self.log_loss_dict("eval_", &t, &losses, &weights)?;
        }
        Ok(())
    }

    /// Logs the weighted mean of every loss term, plus its mean within each
    /// quarter of the timestep range under `{key}_q{0..3}`.
    fn log_loss_dict(
        &mut self,
        prefix: &str,
        t: &Tensor,
        losses: &LossDict,
        weights: &Tensor,
    ) -> Result<(), TchError> {
        let num_timesteps = self.diffusion.num_timesteps() as i64;
        let timesteps = Vec::<i64>::try_from(&t.to_device(Device::Cpu))?;
        for (key, values) in losses {
            let weighted = (values.detach() * weights)
                .to_kind(Kind::Double)
                .to_device(Device::Cpu);
            self.logger
                .logkv_mean(format!("{prefix}{key}"), weighted.mean(Kind::Double).double_value(&[]));
            let per_example = Vec::<f64>::try_from(&weighted.flatten(0, -1))?;
            for (sub_t, sub_loss) in timesteps.iter().zip(per_example) {
                let quartile = 4 * sub_t / num_timesteps;
                self.logger
                    .logkv_mean(format!("{prefix}{key}_q{quartile}"), sub_loss);
            }
        }
        Ok(())
    }

    fn optimize_mixed(&mut self) -> bool {
        if !grads_are_finite(&self.model_params) {
            self.state.lg_loss_scale -= 1.0;
            warn!(
                lg_loss_scale = self.state.lg_loss_scale,
                "Found NaN, decreased lg_loss_scale"
            );
            return false;
        }

        model_grads_to_master_grads(&self.model_params, &self.master);
        let grads = self.master.grads();
        unscale(&grads, 1.0 / 2f64.powf(self.state.lg_loss_scale));
        self.clip_and_log_grad_norm(&grads);
        let lr = self.anneal_lr();
        let params = self.master.tensors();
        self.opt.step(&params, &grads, lr);
        for shadow in &self.ema {
            shadow.update(&params);
        }
        master_params_to_model_params(&self.model_params, &self.master);
        self.state.lg_loss_scale += self.config.fp16_scale_growth;
        true
    }

    fn optimize_full(&mut self) {
        let grads = self.master.grads();
        self.clip_and_log_grad_norm(&grads);
        let lr = self.anneal_lr();
        let params = self.master.tensors();
        self.opt.step(&params, &grads, lr);
        for shadow in &self.ema {
            shadow.update(&params);
        }
    }

    fn clip_and_log_grad_norm(&mut self, grads: &[Tensor]) {
        if self.config.gradient_clipping > 0.0 {
            let before = crate::fp16::clip_grad_norm(grads, self.config.gradient_clipping);
            debug!(grad_norm = before, max = self.config.gradient_clipping, "clipped gradients");
        }
        self.logger.logkv_mean("grad_norm", global_norm(grads));
    }

    fn anneal_lr(&mut self) -> f64 {
        let lr = self.lr_schedule.get_lr(self.state.global_step());
        self.logger.logkv("lr", lr);
        lr
    }

    fn log_step(&mut self) {
        let global_step = self.state.global_step();
        self.logger.logkv("step", global_step as f64);
        self.logger.logkv(
            "samples",
            ((global_step + 1) * self.state.global_batch as u64) as f64,
        );
        if self.config.precision.is_mixed() {
            self.logger.logkv("lg_loss_scale", self.state.lg_loss_scale);
        }
    }

    /// Writes the raw, EMA and optimizer checkpoints for the current step on
    /// rank 0, then waits for every worker.
    pub fn save(&mut self) -> Result<(), TrainerError> {
        let global_step = self.state.global_step();
        if self.ctx.is_main() {
            fs::create_dir_all(&self.checkpoint_dir).map_err(|source| CheckpointError::Write {
                path: self.checkpoint_dir.clone(),
                source,
            })?;
            info!(global_step, dir = %self.checkpoint_dir.display(), "saving model");
            let raw = self.named_views(&self.master.tensors());
            save_state_dict(
                &self.checkpoint_dir.join(model_checkpoint_filename(global_step)),
                &raw,
            )?;
            for shadow in &self.ema {
                info!(global_step, rate = %shadow.rate, "saving EMA");
                save_state_dict(
                    &self
                        .checkpoint_dir
                        .join(ema_checkpoint_filename(shadow.rate, global_step)),
                    &self.named_views(&shadow.params),
                )?;
            }
            save_state_dict(
                &self
                    .checkpoint_dir
                    .join(optimizer_checkpoint_filename(global_step)),
                &self.opt.state_dict(),
            )?;
        }
        self.ctx.communicator.barrier()?;
        self.last_saved_step = Some(global_step);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn config_defaults_and_ema_rate_forms() {
        let config: TrainerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TrainerConfig::default());
        assert_eq!(config.initial_lg_loss_scale, 20.0);
        assert_eq!(config.ema_rate, default_ema_rates());

        let joined: TrainerConfig =
            serde_json::from_str(r#"{"ema_rate": "0.9999,0.999"}"#).unwrap();
        let list: TrainerConfig = serde_json::from_str(r#"{"ema_rate": [0.9999, 0.999]}"#).unwrap();
        assert_eq!(joined.ema_rate, list.ema_rate);
        assert_eq!(joined.ema_rate.len(), 2);

        let single: TrainerConfig = serde_json::from_str(r#"{"ema_rate": 0.5}"#).unwrap();
        assert_eq!(single.ema_rate, vec![EmaRate::new(0.5).unwrap()]);

        assert!(serde_json::from_str::<TrainerConfig>(r#"{"ema_rate": "2.0"}"#).is_err());
    }

    #[test]
    fn mixed_precision_config() {
        let config: TrainerConfig = serde_json::from_str(
            r#"{"precision": {"type": "mixed", "kind": "Half"}, "lr_anneal_steps": 100, "warmup_steps": 10}"#,
        )
        .unwrap();
        assert!(config.precision.is_mixed());
        assert_eq!(config.lr_schedule().total_steps(), Some(100));
    }
}
