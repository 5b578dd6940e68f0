use anyhow::{Context, Result};
use clap::Parser;
use moldiff_core::{
    logging::{logging, LogOutput},
    parse_ema_rates, RunEnvironment,
};
use moldiff_modeling::{
    synthetic_batches, Devices, DistributedContext, DummyDenoiser, DummyDiffusion, MetricsLogger,
    Precision, Trainer, TrainerConfig, WorkingKind,
};
use std::{path::PathBuf, thread::JoinHandle};
use tracing::{error, info, Level};

#[derive(Parser, Debug, Clone)]
struct Args {
    /// JSON trainer configuration. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    microbatch: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    /// Comma-separated EMA decay rates, e.g. "0.9999,0.999"
    #[arg(long)]
    ema_rate: Option<String>,

    #[arg(long)]
    log_interval: Option<u64>,

    #[arg(long)]
    save_interval: Option<u64>,

    #[arg(long)]
    lr_anneal_steps: Option<u64>,

    #[arg(long)]
    resume_checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    auto_resume: bool,

    #[arg(long, default_value_t = false)]
    fp16: bool,

    #[arg(long)]
    checkpoint_path: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value_t = 1)]
    data_parallelism: usize,

    #[arg(
        long,
        help = "Device(s) to use: auto, cpu, cuda, cuda:N, cuda:X,Y,Z",
        default_value = "auto"
    )]
    device: Devices,

    #[arg(long, default_value_t = 64)]
    sequence_length: i64,

    #[arg(long, default_value_t = 256)]
    vocab_size: i64,

    #[arg(long, default_value_t = 1000)]
    diffusion_steps: usize,

    /// Directory for progress.jsonl. Defaults to the run's log directory.
    #[arg(long)]
    metrics_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogOutput::Console)]
    logs: LogOutput,

    #[arg(long, default_value = "info")]
    log_level: Level,

    #[arg(long)]
    write_log: Option<PathBuf>,
}

impl Args {
    fn trainer_config(&self) -> Result<TrainerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing trainer config {}", path.display()))?
            }
            None => TrainerConfig::default(),
        };
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.microbatch {
            config.microbatch = v;
        }
        if let Some(v) = self.lr {
            config.lr = v;
        }
        if let Some(v) = &self.ema_rate {
            config.ema_rate = parse_ema_rates(v)?;
        }
        if let Some(v) = self.log_interval {
            config.log_interval = v;
        }
        if let Some(v) = self.save_interval {
            config.save_interval = v;
        }
        if let Some(v) = self.lr_anneal_steps {
            config.lr_anneal_steps = v;
        }
        if let Some(v) = &self.resume_checkpoint {
            config.resume_checkpoint = Some(v.clone());
        }
        if let Some(v) = &self.checkpoint_path {
            config.checkpoint_path = v.clone();
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        config.auto_resume |= self.auto_resume;
        if self.fp16 {
            config.precision = Precision::Mixed {
                kind: WorkingKind::Half,
            };
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging()
        .with_output(args.logs)
        .with_level(args.log_level)
        .with_log_file(args.write_log.clone())
        .init()?;

    let config = args.trainer_config()?;
    let env = RunEnvironment::from_env();
    let metrics_dir = args
        .metrics_dir
        .clone()
        .or_else(|| env.log_dir.clone())
        .unwrap_or_else(|| config.checkpoint_path.clone());
    info!(
        world_size = args.data_parallelism,
        devices = %args.device,
        metrics = %metrics_dir.display(),
        "starting training"
    );

    let handles: Vec<JoinHandle<Result<()>>> =
        DistributedContext::thread_group(args.data_parallelism, &args.device)
            .into_iter()
            .map(|ctx| {
                let args = args.clone();
                let config = config.clone();
                let env = env.clone();
                let metrics_dir = metrics_dir.clone();
                std::thread::spawn(move || {
                    let rank = ctx.rank;
                    let logger = MetricsLogger::open(&metrics_dir, &ctx)?;
                    let model = DummyDenoiser::new(
                        args.sequence_length,
                        args.diffusion_steps,
                        ctx.device,
                    );
                    let diffusion = DummyDiffusion::new(args.diffusion_steps, args.vocab_size);
                    let data = synthetic_batches(
                        config.batch_size as i64,
                        args.sequence_length,
                        args.vocab_size,
                        config.seed.wrapping_add(rank as u64),
                    );
                    let mut trainer = Trainer::new(
                        config,
                        Box::new(model),
                        Box::new(diffusion),
                        data,
                        ctx,
                        logger,
                        env,
                    )?;
                    trainer.run_loop()?;
                    info!(rank, state = ?trainer.state(), "worker finished");
                    Ok(())
                })
            })
            .collect();

    let mut failed = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!("worker failed: {err:#}");
                failed.get_or_insert(err);
            }
            Err(_) => {
                failed.get_or_insert(anyhow::anyhow!("worker panicked"));
            }
        }
    }
    match failed {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
