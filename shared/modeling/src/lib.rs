mod batch;
mod checkpoint;
mod device_utils;
mod diffusion;
mod distributed;
mod dummy;
mod ema;
pub mod fp16;
mod logger;
mod optimizer;
mod resample;
mod trainer;
mod variable;

pub use batch::{DataItem, TensorDict, INPUT_IDS};
pub use checkpoint::{copy_state_dict_into, load_state_dict, save_state_dict, CheckpointError};
pub use device_utils::{get_optimal_devices, Devices, DevicesParseError};
pub use diffusion::{Diffusion, DiffusionModel, LossDict, LOSS_KEY};
pub use distributed::{
    sync_params, AllReduce, Communicator, CommunicatorError, DistributedContext, ReduceType,
    ThreadGroupMember,
};
pub use dummy::{synthetic_batches, DummyDenoiser, DummyDiffusion};
pub use ema::{update_ema, EmaShadow};
pub use fp16::{MasterParams, Precision, WorkingKind};
pub use logger::{load_progress, LoggerError, MetricsLogger, PROGRESS_FILENAME};
pub use optimizer::{AdamW, AdamWConfig, OptimizerStateError};
pub use resample::{
    create_named_schedule_sampler, LossSecondMomentResampler, SamplerError, ScheduleSampler,
    UniformSampler,
};
pub use trainer::{Trainer, TrainerConfig, TrainerError, TrainingState};
pub use variable::{named_parameters, parameter_names, parameters};
