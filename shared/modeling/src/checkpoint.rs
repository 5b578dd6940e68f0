use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tch::{Device, TchError, Tensor};
use thiserror::Error;

use crate::OptimizerStateError;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read checkpoint {path}: {source}")]
    Read { path: PathBuf, source: TchError },

    #[error("failed to serialize checkpoint {path}: {source}")]
    Serialize { path: PathBuf, source: TchError },

    #[error("checkpoint has no tensor named {0}")]
    MissingTensor(String),

    #[error("checkpoint has unexpected tensor {0}")]
    UnexpectedTensor(String),

    #[error("checkpoint tensor {name} has shape {got:?}, model expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        got: Vec<i64>,
    },

    #[error("invalid optimizer state: {0}")]
    Optimizer(#[from] OptimizerStateError),
}

/// Writes `entries` to `path` through a sibling temp file, so a crash mid-write
/// never leaves a truncated checkpoint under the final name.
pub fn save_state_dict(path: &Path, entries: &[(String, Tensor)]) -> Result<(), CheckpointError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let owned = entries
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.detach().copy()))
        .collect::<Vec<_>>();
    Tensor::save_multi(&owned, &tmp).map_err(|source| CheckpointError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_state_dict(path: &Path, device: Device) -> Result<Vec<(String, Tensor)>, CheckpointError> {
    Tensor::load_multi_with_device(path, device).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Copies every entry into the parameter of the same name, converting kind and
/// device. Names must match exactly in both directions.
pub fn copy_state_dict_into(
    params: &[(String, Tensor)],
    entries: Vec<(String, Tensor)>,
) -> Result<(), CheckpointError> {
    let mut entries: HashMap<String, Tensor> = entries.into_iter().collect();
    let _guard = tch::no_grad_guard();
    for (name, param) in params {
        let src = entries
            .remove(name)
            .ok_or_else(|| CheckpointError::MissingTensor(name.clone()))?;
        if src.size() != param.size() {
            return Err(CheckpointError::ShapeMismatch {
                name: name.clone(),
                expected: param.size(),
                got: src.size(),
            });
        }
        param.shallow_clone().copy_(&src);
    }
    match entries.into_keys().min() {
        Some(unexpected) => Err(CheckpointError::UnexpectedTensor(unexpected)),
        None => Ok(()),
    }
}
