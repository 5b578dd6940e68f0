use std::{collections::BTreeMap, path::Path, thread};

use moldiff_core::{EmaRate, RunEnvironment};
use moldiff_modeling::{
    load_progress, synthetic_batches, DataItem, Devices, DistributedContext, DummyDenoiser,
    DummyDiffusion, MasterParams, MetricsLogger, Precision, Trainer, TrainerConfig, TrainerError,
    WorkingKind, PROGRESS_FILENAME,
};
use pretty_assertions::assert_eq;
use tch::{Device, Kind, Tensor};

const SEQ_LEN: i64 = 8;
const VOCAB: i64 = 64;
const TIMESTEPS: usize = 100;

fn config(checkpoint_dir: &Path) -> TrainerConfig {
    TrainerConfig {
        batch_size: 4,
        microbatch: 2,
        lr: 1e-2,
        ema_rate: vec![EmaRate::new(0.999).unwrap()],
        log_interval: 1,
        save_interval: 5,
        lr_anneal_steps: 10,
        checkpoint_path: checkpoint_dir.to_path_buf(),
        seed: 42,
        ..TrainerConfig::default()
    }
}

fn data(config: &TrainerConfig, seed: u64) -> impl Iterator<Item = DataItem> {
    synthetic_batches(config.batch_size as i64, SEQ_LEN, VOCAB, seed)
}

fn trainer(
    config: TrainerConfig,
    diffusion: DummyDiffusion,
    data: impl Iterator<Item = DataItem> + 'static,
    ctx: DistributedContext,
    metrics_dir: &Path,
    env: RunEnvironment,
) -> Result<Trainer, TrainerError> {
    let logger = MetricsLogger::open(metrics_dir, &ctx).unwrap();
    let model = DummyDenoiser::new(SEQ_LEN, TIMESTEPS, ctx.device);
    Trainer::new(
        config,
        Box::new(model),
        Box::new(diffusion),
        data,
        ctx,
        logger,
        env,
    )
}

fn single_trainer(config: TrainerConfig, metrics_dir: &Path) -> Trainer {
    let data = data(&config, 7);
    trainer(
        config,
        DummyDiffusion::new(TIMESTEPS, VOCAB),
        data,
        DistributedContext::single(Device::Cpu),
        metrics_dir,
        RunEnvironment::default(),
    )
    .unwrap()
}

fn host(tensors: &[Tensor]) -> Vec<Vec<f32>> {
    tensors
        .iter()
        .map(|t| Vec::<f32>::try_from(&t.to_kind(Kind::Float).flatten(0, -1)).unwrap())
        .collect()
}

fn progress(dir: &Path) -> Vec<BTreeMap<String, f64>> {
    load_progress(dir.join(PROGRESS_FILENAME)).unwrap()
}

#[test]
fn checkpoints_are_named_by_completed_step() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    let mut trainer = single_trainer(config(ckpt.path()), metrics.path());
    trainer.run_loop().unwrap();

    assert_eq!(trainer.state().step, 10);
    for step in ["000005", "000010"] {
        for name in [
            format!("model{step}.pt"),
            format!("ema_0.999_{step}.pt"),
            format!("opt{step}.pt"),
        ] {
            assert!(ckpt.path().join(&name).is_file(), "missing {name}");
        }
    }
    let mut files = std::fs::read_dir(ckpt.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect::<Vec<_>>();
    files.sort();
    assert_eq!(files.len(), 6, "unexpected files: {files:?}");

    let records = progress(metrics.path());
    assert_eq!(records.len(), 10);
    assert_eq!(records[0]["step"], 0.0);
    assert_eq!(records[9]["samples"], 40.0);
    assert!(records[0]["loss"].is_finite());
    assert!(records[0].contains_key("grad_norm"));
    assert!(records[0].keys().any(|k| k.starts_with("loss_q")));
    assert!(!records[0].contains_key("lg_loss_scale"));
}

#[test]
fn resume_continues_the_same_trajectory() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    let mut uninterrupted = single_trainer(config(ckpt.path()), metrics.path());
    uninterrupted.run_loop().unwrap();

    let resumed_ckpt = tempfile::tempdir().unwrap();
    let resumed_metrics = tempfile::tempdir().unwrap();
    let mut resumed_config = config(resumed_ckpt.path());
    resumed_config.resume_checkpoint = Some(ckpt.path().join("model000005.pt"));
    let data = data(&resumed_config, 7).skip(5);
    let mut resumed = trainer(
        resumed_config,
        DummyDiffusion::new(TIMESTEPS, VOCAB),
        data,
        DistributedContext::single(Device::Cpu),
        resumed_metrics.path(),
        RunEnvironment::default(),
    )
    .unwrap();
    assert_eq!(resumed.state().resume_step, 5);
    assert_eq!(resumed.optimizer_steps(), 5);
    resumed.run_loop().unwrap();

    assert_eq!(resumed.state().step, 5);
    assert_eq!(resumed.state().global_step(), 10);
    assert_eq!(progress(&resumed_metrics.path())[..], progress(metrics.path())[5..]);
    assert_eq!(
        host(&resumed.master_params().tensors()),
        host(&uninterrupted.master_params().tensors())
    );
    assert_eq!(
        host(&resumed.ema()[0].params),
        host(&uninterrupted.ema()[0].params)
    );
    assert!(resumed_ckpt.path().join("model000010.pt").is_file());
}

#[test]
fn auto_resume_finds_latest_checkpoint() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    single_trainer(config(ckpt.path()), metrics.path())
        .run_loop()
        .unwrap();

    let mut resumed_config = config(ckpt.path());
    resumed_config.auto_resume = true;
    let resumed = single_trainer(resumed_config, metrics.path());
    assert_eq!(resumed.state().resume_step, 10);
}

fn mixed_config(checkpoint_dir: &Path) -> TrainerConfig {
    TrainerConfig {
        precision: Precision::Mixed {
            kind: WorkingKind::Half,
        },
        initial_lg_loss_scale: 4.0,
        fp16_scale_growth: 0.25,
        lr_anneal_steps: 3,
        save_interval: 100,
        ..config(checkpoint_dir)
    }
}

#[test]
fn non_finite_gradients_skip_the_step_and_back_off() {
    let ckpt = tempfile::tempdir().unwrap();
    let config = mixed_config(ckpt.path());
    let mut batches = data(&config, 3);
    let mut trainer = trainer(
        config,
        DummyDiffusion::new(TIMESTEPS, VOCAB).with_nan_at_steps([0]),
        std::iter::empty(),
        DistributedContext::single(Device::Cpu),
        ckpt.path(),
        RunEnvironment::default(),
    )
    .unwrap();

    let params_before = host(&trainer.master_params().tensors());
    let ema_before = host(&trainer.ema()[0].params);
    let (batch, cond) = batches.next().unwrap();
    assert!(!trainer.run_step(&batch, cond.as_ref()).unwrap());

    assert_eq!(trainer.state().lg_loss_scale, 3.0);
    assert_eq!(trainer.optimizer_steps(), 0);
    assert_eq!(host(&trainer.master_params().tensors()), params_before);
    assert_eq!(host(&trainer.ema()[0].params), ema_before);
}

#[test]
fn loss_scale_grows_after_finite_steps() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    let config = mixed_config(ckpt.path());
    let data = data(&config, 3);
    let mut trainer = trainer(
        config,
        DummyDiffusion::new(TIMESTEPS, VOCAB).with_nan_at_steps([1]),
        data,
        DistributedContext::single(Device::Cpu),
        metrics.path(),
        RunEnvironment::default(),
    )
    .unwrap();
    assert!(matches!(trainer.master_params(), MasterParams::Mixed { .. }));
    trainer.run_loop().unwrap();

    assert_eq!(trainer.state().lg_loss_scale, 3.5);
    assert_eq!(trainer.optimizer_steps(), 2);
    let scales = progress(metrics.path())
        .iter()
        .map(|r| r["lg_loss_scale"])
        .collect::<Vec<_>>();
    assert_eq!(scales, vec![4.25, 3.25, 3.5]);

    // model weights stay in half precision, checkpoints hold fp32 masters
    let raw = moldiff_modeling::load_state_dict(&ckpt.path().join("model000003.pt"), Device::Cpu)
        .unwrap();
    assert!(raw.iter().all(|(_, t)| t.kind() == Kind::Float));
    assert_eq!(raw.len(), 3);
}

#[test]
fn data_parallel_workers_stay_in_sync() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    let handles = DistributedContext::thread_group(2, &Devices::Cpu)
        .into_iter()
        .map(|ctx| {
            let ckpt = ckpt.path().to_path_buf();
            let metrics = metrics.path().to_path_buf();
            thread::spawn(move || {
                let config = TrainerConfig {
                    lr_anneal_steps: 3,
                    save_interval: 3,
                    ..config(&ckpt)
                };
                // each worker sees different examples
                let data = data(&config, 100 + ctx.rank as u64);
                let mut trainer = trainer(
                    config,
                    DummyDiffusion::new(TIMESTEPS, VOCAB),
                    data,
                    ctx,
                    &metrics,
                    RunEnvironment::default(),
                )
                .unwrap();
                let initial = host(&trainer.master_params().tensors());
                trainer.run_loop().unwrap();
                (
                    initial,
                    host(&trainer.master_params().tensors()),
                    trainer.state().global_batch,
                )
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(results[0].1, results[1].1);
    assert_ne!(results[0].0, results[0].1);
    assert_eq!(results[0].2, 8);
    assert_eq!(progress(metrics.path()).len(), 3);
    assert!(ckpt.path().join("model000003.pt").is_file());
}

#[test]
fn smoke_test_stops_after_first_checkpoint() {
    let fallback = tempfile::tempdir().unwrap();
    let log_dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        lr_anneal_steps: 0,
        save_interval: 2,
        ..config(fallback.path())
    };
    let data = data(&config, 1);
    let env = RunEnvironment {
        log_dir: Some(log_dir.path().to_path_buf()),
        training_test: true,
    };
    let mut trainer = trainer(
        config,
        DummyDiffusion::new(TIMESTEPS, VOCAB),
        data,
        DistributedContext::single(Device::Cpu),
        log_dir.path(),
        env,
    )
    .unwrap();
    trainer.run_loop().unwrap();

    assert_eq!(trainer.state().step, 2);
    assert_eq!(trainer.checkpoint_dir(), log_dir.path());
    assert!(log_dir.path().join("model000002.pt").is_file());
    assert_eq!(std::fs::read_dir(fallback.path()).unwrap().count(), 0);
}

#[test]
fn exhausted_data_is_an_error() {
    let ckpt = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        lr_anneal_steps: 0,
        ..config(ckpt.path())
    };
    let data = data(&config, 1).take(3);
    let mut trainer = trainer(
        config,
        DummyDiffusion::new(TIMESTEPS, VOCAB),
        data,
        DistributedContext::single(Device::Cpu),
        ckpt.path(),
        RunEnvironment::default(),
    )
    .unwrap();
    assert!(matches!(
        trainer.run_loop(),
        Err(TrainerError::DataExhausted)
    ));
    assert_eq!(trainer.state().step, 3);
}

#[test]
fn evaluation_logs_prefixed_losses() {
    let ckpt = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        eval_interval: 2,
        lr_anneal_steps: 4,
        save_interval: 100,
        schedule_sampler: "loss-second-moment".to_owned(),
        ..config(ckpt.path())
    };
    let eval = data(&config, 99);
    let mut trainer = single_trainer(config, ckpt.path()).with_eval_data(eval);
    trainer.run_loop().unwrap();

    let records = progress(ckpt.path());
    // one record per step plus one per evaluation
    assert_eq!(records.len(), 6);
    let eval_records = records
        .iter()
        .filter(|r| r.contains_key("eval_loss"))
        .collect::<Vec<_>>();
    assert_eq!(eval_records.len(), 2);
    assert!(eval_records.iter().all(|r| !r.contains_key("grad_norm")));
}

#[test]
fn unknown_sampler_is_rejected() {
    let ckpt = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        schedule_sampler: "importance".to_owned(),
        ..config(ckpt.path())
    };
    let data = data(&config, 1);
    assert!(matches!(
        trainer(
            config,
            DummyDiffusion::new(TIMESTEPS, VOCAB),
            data,
            DistributedContext::single(Device::Cpu),
            ckpt.path(),
            RunEnvironment::default(),
        ),
        Err(TrainerError::Sampler(_))
    ));
}

#[test]
fn corrupt_resume_checkpoint_fails_every_worker() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    let corrupt = ckpt.path().join("model000005.pt");
    std::fs::write(&corrupt, b"not a tensor archive").unwrap();

    let handles = DistributedContext::thread_group(2, &Devices::Cpu)
        .into_iter()
        .map(|ctx| {
            let mut config = config(ckpt.path());
            config.resume_checkpoint = Some(corrupt.clone());
            let metrics = metrics.path().to_path_buf();
            thread::spawn(move || {
                let communicator = ctx.communicator.clone();
                let data = data(&config, ctx.rank as u64);
                let result = trainer(
                    config,
                    DummyDiffusion::new(TIMESTEPS, VOCAB),
                    data,
                    ctx,
                    &metrics,
                    RunEnvironment::default(),
                );
                (result.err(), communicator.is_cancelled())
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();

    assert!(matches!(results[0].0, Some(TrainerError::Checkpoint(_))));
    assert!(matches!(results[1].0, Some(TrainerError::Communicator(_))));
    assert!(results.iter().all(|(_, cancelled)| *cancelled));
}

#[test]
fn resume_from_checkpoint_saved_before_any_update() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        lr_anneal_steps: 1,
        save_interval: 1,
        ..mixed_config(ckpt.path())
    };
    let batches = data(&config, 3);
    let mut first = trainer(
        config.clone(),
        DummyDiffusion::new(TIMESTEPS, VOCAB).with_nan_at_steps([0]),
        batches,
        DistributedContext::single(Device::Cpu),
        metrics.path(),
        RunEnvironment::default(),
    )
    .unwrap();
    first.run_loop().unwrap();
    assert_eq!(first.optimizer_steps(), 0);
    assert!(ckpt.path().join("opt000001.pt").is_file());

    let resumed_config = TrainerConfig {
        resume_checkpoint: Some(ckpt.path().join("model000001.pt")),
        lr_anneal_steps: 3,
        ..config
    };
    let batches = data(&resumed_config, 3).skip(1);
    let mut resumed = trainer(
        resumed_config,
        DummyDiffusion::new(TIMESTEPS, VOCAB),
        batches,
        DistributedContext::single(Device::Cpu),
        metrics.path(),
        RunEnvironment::default(),
    )
    .unwrap();
    assert_eq!(resumed.state().resume_step, 1);
    assert_eq!(resumed.optimizer_steps(), 0);
    resumed.run_loop().unwrap();
    assert_eq!(resumed.optimizer_steps(), 2);
}

#[test]
fn missing_ema_checkpoint_starts_from_model_weights() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    single_trainer(config(ckpt.path()), metrics.path())
        .run_loop()
        .unwrap();
    std::fs::remove_file(ckpt.path().join("ema_0.999_000005.pt")).unwrap();

    let mut resumed_config = config(ckpt.path());
    resumed_config.resume_checkpoint = Some(ckpt.path().join("model000005.pt"));
    let resumed = single_trainer(resumed_config, metrics.path());

    assert_eq!(resumed.state().resume_step, 5);
    assert_eq!(resumed.optimizer_steps(), 5);
    assert_eq!(
        host(&resumed.ema()[0].params),
        host(&resumed.master_params().tensors())
    );
}

#[test]
fn missing_optimizer_checkpoint_starts_fresh_moments() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    single_trainer(config(ckpt.path()), metrics.path())
        .run_loop()
        .unwrap();
    std::fs::remove_file(ckpt.path().join("opt000005.pt")).unwrap();

    let resumed_ckpt = tempfile::tempdir().unwrap();
    let mut resumed_config = config(resumed_ckpt.path());
    resumed_config.resume_checkpoint = Some(ckpt.path().join("model000005.pt"));
    let data = data(&resumed_config, 7).skip(5);
    let mut resumed = trainer(
        resumed_config,
        DummyDiffusion::new(TIMESTEPS, VOCAB),
        data,
        DistributedContext::single(Device::Cpu),
        metrics.path(),
        RunEnvironment::default(),
    )
    .unwrap();
    assert_eq!(resumed.state().resume_step, 5);
    assert_eq!(resumed.optimizer_steps(), 0);

    resumed.run_loop().unwrap();
    assert_eq!(resumed.optimizer_steps(), 5);
    assert!(resumed_ckpt.path().join("opt000010.pt").is_file());
}

#[test]
fn mixed_precision_resume_continues_the_same_trajectory() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    // constant loss scale, so the unsaved scale cannot diverge across the restart
    let config = TrainerConfig {
        fp16_scale_growth: 0.0,
        lr_anneal_steps: 4,
        save_interval: 2,
        ..mixed_config(ckpt.path())
    };
    let mut uninterrupted = single_trainer(config.clone(), metrics.path());
    uninterrupted.run_loop().unwrap();

    let resumed_ckpt = tempfile::tempdir().unwrap();
    let resumed_metrics = tempfile::tempdir().unwrap();
    let resumed_config = TrainerConfig {
        resume_checkpoint: Some(ckpt.path().join("model000002.pt")),
        checkpoint_path: resumed_ckpt.path().to_path_buf(),
        ..config
    };
    let data = data(&resumed_config, 7).skip(2);
    let mut resumed = trainer(
        resumed_config,
        DummyDiffusion::new(TIMESTEPS, VOCAB),
        data,
        DistributedContext::single(Device::Cpu),
        resumed_metrics.path(),
        RunEnvironment::default(),
    )
    .unwrap();
    assert!(matches!(resumed.master_params(), MasterParams::Mixed { .. }));
    assert_eq!(resumed.optimizer_steps(), 2);
    resumed.run_loop().unwrap();

    assert_eq!(progress(resumed_metrics.path())[..], progress(metrics.path())[2..]);
    assert_eq!(
        host(&resumed.master_params().tensors()),
        host(&uninterrupted.master_params().tensors())
    );
    assert_eq!(
        host(&resumed.ema()[0].params),
        host(&uninterrupted.ema()[0].params)
    );
}

#[test]
fn invalid_learning_rate_is_rejected() {
    let ckpt = tempfile::tempdir().unwrap();
    for lr in [-1.0, f64::NAN, f64::INFINITY] {
        let config = TrainerConfig {
            lr,
            ..config(ckpt.path())
        };
        let data = data(&config, 1);
        assert!(matches!(
            trainer(
                config,
                DummyDiffusion::new(TIMESTEPS, VOCAB),
                data,
                DistributedContext::single(Device::Cpu),
                ckpt.path(),
                RunEnvironment::default(),
            ),
            Err(TrainerError::InvalidLearningRate(_))
        ));
    }
}

#[test]
fn evaluation_stops_on_every_worker_when_one_runs_dry() {
    let ckpt = tempfile::tempdir().unwrap();
    let metrics = tempfile::tempdir().unwrap();
    let handles = DistributedContext::thread_group(2, &Devices::Cpu)
        .into_iter()
        .map(|ctx| {
            let ckpt = ckpt.path().to_path_buf();
            let metrics = metrics.path().to_path_buf();
            thread::spawn(move || {
                let config = TrainerConfig {
                    eval_interval: 1,
                    lr_anneal_steps: 3,
                    save_interval: 100,
                    ..config(&ckpt)
                };
                let rank = ctx.rank;
                let batches = data(&config, 100 + rank as u64);
                let eval = data(&config, 200 + rank as u64);
                let eval: Box<dyn Iterator<Item = DataItem>> = match rank {
                    0 => Box::new(eval.take(1)),
                    _ => Box::new(eval),
                };
                let mut trainer = trainer(
                    config,
                    DummyDiffusion::new(TIMESTEPS, VOCAB),
                    batches,
                    ctx,
                    &metrics,
                    RunEnvironment::default(),
                )
                .unwrap()
                .with_eval_data(eval);
                trainer.run_loop().map(|_| trainer.state().step)
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), 3);
    }

    let records = progress(metrics.path());
    // three steps plus the single evaluation every worker could run
    assert_eq!(records.len(), 4);
    assert_eq!(
        records.iter().filter(|r| r.contains_key("eval_loss")).count(),
        1
    );
}
