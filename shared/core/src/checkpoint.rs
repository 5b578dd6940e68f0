//! Checkpoint file naming.
//!
//! Resumption recovers the step number from these names, so the formats here are
//! load-bearing: `model{step:06}.pt`, `ema_{rate}_{step:06}.pt` and `opt{step:06}.pt`.

use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

pub const MODEL_CHECKPOINT_PREFIX: &str = "model";
pub const CHECKPOINT_EXTENSION: &str = "pt";

/// Decay rate of one EMA shadow. Rendered with `Display` in checkpoint names.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, PartialOrd)]
#[serde(try_from = "f64", into = "f64")]
pub struct EmaRate(f64);

#[derive(Debug, Error, PartialEq)]
pub enum EmaRateParseError {
    #[error("EMA rate {0} is outside [0, 1]")]
    OutOfRange(f64),

    #[error("invalid EMA rate '{0}'")]
    Invalid(String),

    #[error("no EMA rates given")]
    Empty,
}

impl EmaRate {
    pub fn new(rate: f64) -> Result<Self, EmaRateParseError> {
        match (0.0..=1.0).contains(&rate) {
            true => Ok(Self(rate)),
            false => Err(EmaRateParseError::OutOfRange(rate)),
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for EmaRate {
    type Error = EmaRateParseError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EmaRate> for f64 {
    fn from(value: EmaRate) -> Self {
        value.0
    }
}

impl fmt::Display for EmaRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EmaRate {
    type Err = EmaRateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rate = s
            .trim()
            .parse::<f64>()
            .map_err(|_| EmaRateParseError::Invalid(s.to_owned()))?;
        Self::new(rate)
    }
}

/// Parses a comma-separated list such as `"0.9999,0.999"`.
pub fn parse_ema_rates(s: &str) -> Result<Vec<EmaRate>, EmaRateParseError> {
    let rates = s
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(EmaRate::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    match rates.is_empty() {
        true => Err(EmaRateParseError::Empty),
        false => Ok(rates),
    }
}

pub fn model_checkpoint_filename(step: u64) -> String {
    format!("{MODEL_CHECKPOINT_PREFIX}{step:06}.{CHECKPOINT_EXTENSION}")
}

pub fn ema_checkpoint_filename(rate: EmaRate, step: u64) -> String {
    format!("ema_{rate}_{step:06}.{CHECKPOINT_EXTENSION}")
}

pub fn optimizer_checkpoint_filename(step: u64) -> String {
    format!("opt{step:06}.{CHECKPOINT_EXTENSION}")
}

/// Recovers the step from a path like `path/to/model000123.pt`.
///
/// Takes the text after the last `model` literal up to the first `.`. A path without
/// the literal, or whose suffix is not a decimal integer, is a cold start (step 0).
pub fn parse_resume_step_from_filename(path: impl AsRef<Path>) -> u64 {
    let path = path.as_ref().to_string_lossy();
    let Some((_, suffix)) = path.rsplit_once(MODEL_CHECKPOINT_PREFIX) else {
        return 0;
    };
    suffix
        .split('.')
        .next()
        .and_then(|digits| digits.parse::<u64>().ok())
        .unwrap_or(0)
}

fn sibling(main_checkpoint: &Path, filename: String) -> PathBuf {
    match main_checkpoint.parent() {
        Some(dir) => dir.join(filename),
        None => PathBuf::from(filename),
    }
}

/// The EMA checkpoint written next to `main_checkpoint` for `step`, if it exists.
pub fn find_ema_checkpoint(main_checkpoint: &Path, step: u64, rate: EmaRate) -> Option<PathBuf> {
    let path = sibling(main_checkpoint, ema_checkpoint_filename(rate, step));
    path.is_file().then_some(path)
}

pub fn optimizer_checkpoint_path(main_checkpoint: &Path, step: u64) -> PathBuf {
    sibling(main_checkpoint, optimizer_checkpoint_filename(step))
}

/// Highest-step `modelNNNNNN.pt` in `dir`. A missing directory has no checkpoints.
pub fn find_latest_checkpoint(dir: &Path) -> io::Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut latest: Option<(u64, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(step) = name
            .to_str()
            .and_then(|name| name.strip_prefix(MODEL_CHECKPOINT_PREFIX))
            .and_then(|rest| rest.strip_suffix(".pt"))
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        if latest.as_ref().is_none_or(|(best, _)| step > *best) {
            latest = Some((step, entry.path()));
        }
    }
    Ok(latest.map(|(_, path)| path))
}
