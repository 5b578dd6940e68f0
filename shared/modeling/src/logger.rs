//! Key/value metrics for the training loop.
//!
//! Values accumulate between flushes. A flush combines every worker's values
//! into one record, which rank 0 appends to `progress.jsonl` and echoes to the
//! tracing output.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

use crate::{CommunicatorError, DistributedContext};

pub const PROGRESS_FILENAME: &str = "progress.jsonl";

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("failed to write metrics: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode metrics: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to combine metrics across workers: {0}")]
    Communicator(#[from] CommunicatorError),
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    sum: f64,
    count: f64,
}

/// Wire form of an accumulator. Bit patterns survive NaN and infinities, which
/// JSON numbers do not.
#[derive(Serialize, Deserialize)]
struct AccumulatorBits([u64; 2]);

impl From<Accumulator> for AccumulatorBits {
    fn from(acc: Accumulator) -> Self {
        Self([acc.sum.to_bits(), acc.count.to_bits()])
    }
}

impl From<AccumulatorBits> for Accumulator {
    fn from(AccumulatorBits([sum, count]): AccumulatorBits) -> Self {
        Self {
            sum: f64::from_bits(sum),
            count: f64::from_bits(count),
        }
    }
}

pub struct MetricsLogger {
    output_path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    values: BTreeMap<String, Accumulator>,
    records_written: u64,
}

impl MetricsLogger {
    /// Opens `dir/progress.jsonl` for appending. Only rank 0 writes; other
    /// ranks still accumulate so their values join the combined record.
    pub fn open(dir: &Path, ctx: &DistributedContext) -> std::io::Result<Self> {
        if !ctx.is_main() {
            return Ok(Self::disabled());
        }
        fs::create_dir_all(dir)?;
        let output_path = dir.join(PROGRESS_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)?;
        Ok(Self {
            output_path: Some(output_path),
            writer: Some(BufWriter::new(file)),
            values: BTreeMap::new(),
            records_written: 0,
        })
    }

    /// A logger that accumulates and combines but never writes a file.
    pub fn disabled() -> Self {
        Self {
            output_path: None,
            writer: None,
            values: BTreeMap::new(),
            records_written: 0,
        }
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Sets `key`, replacing anything logged under it since the last flush.
    pub fn logkv(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(
            key.into(),
            Accumulator {
                sum: value,
                count: 1.0,
            },
        );
    }

    /// Adds an observation to the running mean of `key`.
    pub fn logkv_mean(&mut self, key: impl Into<String>, value: f64) {
        let acc = self.values.entry(key.into()).or_default();
        acc.sum += value;
        acc.count += 1.0;
    }

    /// This worker's current value of `key`.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).map(|acc| acc.sum / acc.count)
    }

    /// Combines the accumulated values across workers, weighting each worker's
    /// mean by its observation count, writes the record on rank 0 and resets.
    ///
    /// Every worker must call this at the same point in the loop.
    pub fn dumpkvs(
        &mut self,
        ctx: &DistributedContext,
    ) -> Result<BTreeMap<String, f64>, LoggerError> {
        let local = std::mem::take(&mut self.values);
        let combined = match ctx.is_distributed() {
            false => local,
            true => {
                let wire = local
                    .into_iter()
                    .map(|(key, acc)| (key, AccumulatorBits::from(acc)))
                    .collect::<BTreeMap<_, _>>();
                let payload = serde_json::to_vec(&wire)?;
                let mut combined: BTreeMap<String, Accumulator> = BTreeMap::new();
                for bytes in ctx.communicator.all_gather_bytes(&payload)? {
                    let theirs: BTreeMap<String, AccumulatorBits> = serde_json::from_slice(&bytes)?;
                    for (key, acc) in theirs {
                        let acc = Accumulator::from(acc);
                        let entry = combined.entry(key).or_default();
                        entry.sum += acc.sum;
                        entry.count += acc.count;
                    }
                }
                combined
            }
        };
        let record = combined
            .into_iter()
            .map(|(key, acc)| (key, acc.sum / acc.count))
            .collect::<BTreeMap<_, _>>();

        if let Some(writer) = &mut self.writer {
            let json = serde_json::to_string(&record)?;
            writeln!(writer, "{json}")?;
            writer.flush()?;
            self.records_written += 1;
            info!(
                "{}",
                record
                    .iter()
                    .map(|(k, v)| format!("{k}={v:.6}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            );
        }
        Ok(record)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn close(mut self) -> std::io::Result<()> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Reads back every record in a progress file. Non-finite values, written as
/// `null`, read back as NaN.
pub fn load_progress(path: impl AsRef<Path>) -> std::io::Result<Vec<BTreeMap<String, f64>>> {
    fs::read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| -> std::io::Result<BTreeMap<String, f64>> {
            let record: BTreeMap<String, Option<f64>> = serde_json::from_str(line)?;
            Ok(record
                .into_iter()
                .map(|(key, value)| (key, value.unwrap_or(f64::NAN)))
                .collect())
        })
        .collect()
}
