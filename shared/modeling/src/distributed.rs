use moldiff_core::{Barrier, CancellableBarrier, CancelledBarrier};
use std::sync::{Arc, Mutex};
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;

use crate::Devices;

#[derive(Debug, Error)]
pub enum CommunicatorError {
    #[error("a peer worker failed during a collective")]
    Cancelled(#[from] CancelledBarrier),

    #[error("rank {rank} contributed {got} values to a collective expecting {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },

    #[error("broadcast root {root} is outside a group of {world_size}")]
    InvalidRoot { root: usize, world_size: usize },

    #[error("torch error: {0}")]
    Torch(#[from] TchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceType {
    Sum,
    Max,
    Mean,
}

#[derive(Debug)]
struct ThreadGroupShared {
    slots: Mutex<Vec<Vec<u8>>>,
    barrier: CancellableBarrier,
}

/// One worker's handle on an in-process group whose workers are OS threads.
///
/// Every collective is a two-phase exchange: each rank publishes into its own
/// slot, all ranks rendezvous, each reads every slot, and a second rendezvous
/// keeps a fast rank from overwriting its slot before the slow ones have read it.
#[derive(Debug, Clone)]
pub struct ThreadGroupMember {
    rank: usize,
    shared: Arc<ThreadGroupShared>,
}

impl ThreadGroupMember {
    /// Creates the handles for a group of `world_size` workers, indexed by rank.
    pub fn group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(ThreadGroupShared {
            slots: Mutex::new(vec![Vec::new(); world_size]),
            barrier: CancellableBarrier::new(world_size),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }

    fn exchange(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, CommunicatorError> {
        self.shared.slots.lock().unwrap_or_else(|e| e.into_inner())[self.rank] = payload;
        self.shared.barrier.wait()?;
        let all = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.shared.barrier.wait()?;
        Ok(all)
    }
}

#[derive(Debug)]
pub enum Communicator {
    /// A single worker. Every collective is the identity.
    None,
    Threads(ThreadGroupMember),
}

fn encode(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect()
}

impl Communicator {
    pub fn world_size(&self) -> usize {
        match self {
            Communicator::None => 1,
            Communicator::Threads(member) => member.shared.barrier.parties(),
        }
    }

    /// Reduces `values` elementwise across every worker, in place.
    ///
    /// Contributions are combined in rank order so every worker ends up with
    /// bit-identical results.
    pub fn all_reduce(&self, values: &mut [f64], op: ReduceType) -> Result<(), CommunicatorError> {
        let Communicator::Threads(member) = self else {
            return Ok(());
        };
        let contributions = member.exchange(encode(values))?;
        let world_size = contributions.len();
        let mut reduced: Option<Vec<f64>> = None;
        for (rank, bytes) in contributions.iter().enumerate() {
            let theirs = decode(bytes);
            if theirs.len() != values.len() {
                return Err(CommunicatorError::LengthMismatch {
                    rank,
                    expected: values.len(),
                    got: theirs.len(),
                });
            }
            reduced = Some(match reduced {
                None => theirs,
                Some(mut acc) => {
                    for (a, b) in acc.iter_mut().zip(theirs) {
                        *a = match op {
                            ReduceType::Sum | ReduceType::Mean => *a + b,
                            ReduceType::Max => a.max(b),
                        };
                    }
                    acc
                }
            });
        }
        if let Some(reduced) = reduced {
            values.copy_from_slice(&reduced);
        }
        if op == ReduceType::Mean {
            values.iter_mut().for_each(|v| *v /= world_size as f64);
        }
        Ok(())
    }

    /// Overwrites `values` on every worker with the contents held by `root`.
    pub fn broadcast(&self, values: &mut [f64], root: usize) -> Result<(), CommunicatorError> {
        let Communicator::Threads(member) = self else {
            return Ok(());
        };
        let world_size = self.world_size();
        if root >= world_size {
            return Err(CommunicatorError::InvalidRoot { root, world_size });
        }
        let payload = match member.rank == root {
            true => encode(values),
            false => Vec::new(),
        };
        let contributions = member.exchange(payload)?;
        let theirs = decode(&contributions[root]);
        if theirs.len() != values.len() {
            return Err(CommunicatorError::LengthMismatch {
                rank: root,
                expected: values.len(),
                got: theirs.len(),
            });
        }
        values.copy_from_slice(&theirs);
        Ok(())
    }

    /// Every worker's payload, indexed by rank.
    pub fn all_gather_bytes(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CommunicatorError> {
        match self {
            Communicator::None => Ok(vec![payload.to_vec()]),
            Communicator::Threads(member) => member.exchange(payload.to_vec()),
        }
    }

    pub fn barrier(&self) -> Result<(), CommunicatorError> {
        match self {
            Communicator::None => Ok(()),
            Communicator::Threads(member) => Ok(member.shared.barrier.wait()?),
        }
    }

    /// Releases peers blocked in a collective after this worker failed.
    pub fn cancel(&self) {
        if let Communicator::Threads(member) = self {
            member.shared.barrier.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Communicator::None => false,
            Communicator::Threads(member) => member.shared.barrier.is_cancelled(),
        }
    }
}

/// Where this worker sits in the data-parallel group.
#[derive(Debug, Clone)]
pub struct DistributedContext {
    pub rank: usize,
    pub world_size: usize,
    pub device: Device,
    pub communicator: Arc<Communicator>,
}

impl DistributedContext {
    pub fn single(device: Device) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            device,
            communicator: Arc::new(Communicator::None),
        }
    }

    /// Contexts for `world_size` thread workers, one per rank.
    pub fn thread_group(world_size: usize, devices: &Devices) -> Vec<Self> {
        ThreadGroupMember::group(world_size)
            .into_iter()
            .enumerate()
            .map(|(rank, member)| Self {
                rank,
                world_size,
                device: devices.device_for_rank(rank),
                communicator: Arc::new(Communicator::Threads(member)),
            })
            .collect()
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }
}

fn tensors_to_f64(tensors: &[Tensor]) -> Result<Vec<f64>, CommunicatorError> {
    let mut values = Vec::with_capacity(tensors.iter().map(|t| t.numel()).sum());
    for tensor in tensors {
        let host = tensor
            .detach()
            .to_kind(Kind::Double)
            .flatten(0, -1)
            .to_device(Device::Cpu);
        values.extend(Vec::<f64>::try_from(&host)?);
    }
    Ok(values)
}

fn write_f64(tensors: &mut [Tensor], values: &[f64]) {
    let _guard = tch::no_grad_guard();
    let mut offset = 0;
    for tensor in tensors.iter_mut() {
        let numel = tensor.numel();
        let src = Tensor::from_slice(&values[offset..offset + numel]).reshape(tensor.size());
        tensor.copy_(&src);
        offset += numel;
    }
}

pub trait AllReduce {
    fn all_reduce(&mut self, comm: &Communicator, op: ReduceType) -> Result<(), CommunicatorError>;
}

impl AllReduce for [Tensor] {
    /// One collective for the whole list, reduced in f64 and written back in
    /// each tensor's own kind.
    fn all_reduce(&mut self, comm: &Communicator, op: ReduceType) -> Result<(), CommunicatorError> {
        if comm.world_size() == 1 || self.is_empty() {
            return Ok(());
        }
        let mut values = tensors_to_f64(self)?;
        comm.all_reduce(&mut values, op)?;
        write_f64(self, &values);
        Ok(())
    }
}

impl AllReduce for Tensor {
    fn all_reduce(&mut self, comm: &Communicator, op: ReduceType) -> Result<(), CommunicatorError> {
        std::slice::from_mut(self).all_reduce(comm, op)
    }
}

/// Copies rank 0's values of `params` to every other worker.
pub fn sync_params(params: &[Tensor], comm: &Communicator) -> Result<(), CommunicatorError> {
    if comm.world_size() == 1 || params.is_empty() {
        return Ok(());
    }
    let mut values = tensors_to_f64(params)?;
    comm.broadcast(&mut values, 0)?;
    let mut handles = params.iter().map(|p| p.shallow_clone()).collect::<Vec<_>>();
    write_f64(&mut handles, &values);
    Ok(())
}
