use std::{fmt, str::FromStr};

use itertools::Itertools;
use tch::Device;
use thiserror::Error;

fn cuda_device_indices() -> Vec<usize> {
    (0..tch::Cuda::device_count() as usize).collect()
}

/// CUDA when any device is visible, otherwise CPU.
pub fn get_optimal_devices() -> Devices {
    match cuda_device_indices() {
        indices if indices.is_empty() => Devices::Cpu,
        indices => Devices::Cuda(indices),
    }
}

/// The set of devices workers on this host are spread over.
#[derive(Clone, Debug, PartialEq)]
pub enum Devices {
    Cpu,
    Cuda(Vec<usize>),
}

impl Default for Devices {
    fn default() -> Self {
        get_optimal_devices()
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Cpu => write!(f, "CPU"),
            Devices::Cuda(indices) => write!(f, "CUDA({})", indices.iter().join(", ")),
        }
    }
}

impl Devices {
    pub fn is_cuda(&self) -> bool {
        matches!(self, Devices::Cuda(_))
    }

    /// Device for worker `rank`. Workers wrap around the visible GPUs, so a
    /// host with fewer GPUs than workers shares them; CPU is shared by all.
    pub fn device_for_rank(&self, rank: usize) -> Device {
        match self {
            Devices::Cpu => Device::Cpu,
            Devices::Cuda(indices) => Device::Cuda(indices[rank % indices.len()]),
        }
    }
}

fn available_device_strings() -> String {
    let mut strings = vec!["auto".to_owned(), "cpu".to_owned()];
    let cuda = cuda_device_indices();
    if !cuda.is_empty() {
        strings.push("cuda".to_owned());
        strings.push(format!("cuda:{}", cuda.iter().join(",")));
    }
    strings.join(", ")
}

#[derive(Error, Debug)]
pub enum DevicesParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    DeviceNotAvailable(String, String),

    #[error("invalid format for device(s) {0}: '{1}'")]
    InvalidDeviceFormat(String, String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    InvalidDevicesString(String, String),
}

impl FromStr for Devices {
    type Err = DevicesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let cuda_or_unavailable = |name: &str| {
            let available = cuda_device_indices();
            match available.is_empty() {
                true => Err(DevicesParseError::DeviceNotAvailable(
                    name.to_owned(),
                    available_device_strings(),
                )),
                false => Ok(available),
            }
        };
        match s.as_str() {
            "auto" => Ok(get_optimal_devices()),
            "cpu" => Ok(Devices::Cpu),
            "cuda" => cuda_or_unavailable("CUDA").map(Devices::Cuda),
            spec => {
                let Some(ids) = spec.strip_prefix("cuda:") else {
                    return Err(DevicesParseError::InvalidDevicesString(
                        spec.to_owned(),
                        available_device_strings(),
                    ));
                };
                let parsed = ids
                    .split(',')
                    .map(|id| {
                        id.trim().parse::<usize>().map_err(|_| {
                            DevicesParseError::InvalidDeviceFormat(spec.to_owned(), id.to_owned())
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let available = cuda_or_unavailable(spec)?;
                if let Some(missing) = parsed.iter().find(|id| !available.contains(id)) {
                    return Err(DevicesParseError::DeviceNotAvailable(
                        format!("cuda:{missing}"),
                        available_device_strings(),
                    ));
                }
                Ok(Devices::Cuda(parsed))
            }
        }
    }
}
