use tch::{nn::VarStore, Tensor};

/// The store's trainable variables sorted by name.
///
/// `VarStore::variables` is a hash map, so anything that pairs parameters
/// positionally (master copies, EMA shadows, optimizer state, flattening)
/// has to go through this ordering.
pub fn named_parameters(vs: &VarStore) -> Vec<(String, Tensor)> {
    let mut entries: Vec<_> = vs
        .variables()
        .into_iter()
        .filter(|(_, tensor)| tensor.requires_grad())
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

pub fn parameters(vs: &VarStore) -> Vec<Tensor> {
    named_parameters(vs).into_iter().map(|(_, t)| t).collect()
}

pub fn parameter_names(vs: &VarStore) -> Vec<String> {
    named_parameters(vs).into_iter().map(|(name, _)| name).collect()
}
