use std::collections::BTreeMap;
use tch::{Device, Tensor};

/// The key every batch must carry. Its leading dimension is the batch size.
pub const INPUT_IDS: &str = "input_ids";

/// Named tensors sharing a leading batch dimension.
#[derive(Debug, Default)]
pub struct TensorDict(BTreeMap<String, Tensor>);

impl TensorDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(key.into(), tensor)
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn input_ids(&self) -> Option<&Tensor> {
        self.get(INPUT_IDS)
    }

    /// Leading dimension of `input_ids`, if present.
    pub fn batch_size(&self) -> Option<usize> {
        self.input_ids().map(|ids| ids.size()[0] as usize)
    }

    /// Rows `[start, start + len)` of every tensor, moved to `device`. The range
    /// is clamped to each tensor's leading dimension.
    pub fn slice_to(&self, start: usize, len: usize, device: Device) -> Self {
        Self(
            self.0
                .iter()
                .map(|(key, tensor)| {
                    let rows = tensor.size()[0];
                    let start = (start as i64).min(rows);
                    let len = (len as i64).min(rows - start);
                    (key.clone(), tensor.narrow(0, start, len).to_device(device))
                })
                .collect(),
        )
    }
}

impl Clone for TensorDict {
    fn clone(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.shallow_clone()))
                .collect(),
        )
    }
}

impl<K: Into<String>> FromIterator<(K, Tensor)> for TensorDict {
    fn from_iter<I: IntoIterator<Item = (K, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// One item pulled from a data source: the batch and its optional conditioning.
pub type DataItem = (TensorDict, Option<TensorDict>);

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn slices_every_entry_by_rows() {
        let batch: TensorDict = [
            (INPUT_IDS, Tensor::arange(10, (Kind::Int64, Device::Cpu)).reshape([5, 2])),
            ("mask", Tensor::ones([5, 2], (Kind::Float, Device::Cpu))),
        ]
        .into_iter()
        .collect();
        assert_eq!(batch.batch_size(), Some(5));

        let micro = batch.slice_to(2, 2, Device::Cpu);
        assert_eq!(micro.batch_size(), Some(2));
        assert_eq!(
            Vec::<i64>::try_from(&micro.input_ids().unwrap().flatten(0, -1)).unwrap(),
            vec![4, 5, 6, 7]
        );
        assert_eq!(micro.get("mask").unwrap().size(), vec![2, 2]);

        let tail = batch.slice_to(4, 2, Device::Cpu);
        assert_eq!(tail.batch_size(), Some(1));
    }

    #[test]
    fn missing_input_ids_has_no_batch_size() {
        let cond: TensorDict = [("labels", Tensor::zeros([3], (Kind::Int64, Device::Cpu)))]
            .into_iter()
            .collect();
        assert_eq!(cond.batch_size(), None);
        assert_eq!(cond.len(), 1);
    }
}
