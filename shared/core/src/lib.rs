mod barrier;
mod checkpoint;
mod env;
pub mod logging;
mod lr;

pub use barrier::{Barrier, CancellableBarrier, CancelledBarrier};
pub use checkpoint::{
    ema_checkpoint_filename, find_ema_checkpoint, find_latest_checkpoint, model_checkpoint_filename,
    optimizer_checkpoint_filename, optimizer_checkpoint_path, parse_ema_rates,
    parse_resume_step_from_filename, EmaRate, EmaRateParseError, CHECKPOINT_EXTENSION,
    MODEL_CHECKPOINT_PREFIX,
};
pub use env::{RunEnvironment, LOGDIR_ENV, TRAINING_TEST_ENV};
pub use lr::{ConstantLR, LearningRateSchedule, LearningRateScheduler, LinearAnnealLR};
