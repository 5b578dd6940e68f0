use std::path::PathBuf;

/// Overrides the directory checkpoints and metrics are written to.
pub const LOGDIR_ENV: &str = "DIFFUSION_BLOB_LOGDIR";
/// When truthy, training stops right after the first checkpoint is written.
pub const TRAINING_TEST_ENV: &str = "DIFFUSION_TRAINING_TEST";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunEnvironment {
    pub log_dir: Option<PathBuf>,
    pub training_test: bool,
}

impl RunEnvironment {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_dir = lookup(LOGDIR_ENV)
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);
        let training_test = lookup(TRAINING_TEST_ENV)
            .map(|value| is_truthy(&value))
            .unwrap_or(false);
        Self {
            log_dir,
            training_test,
        }
    }

    /// The environment override if set, otherwise `fallback`.
    pub fn checkpoint_dir(&self, fallback: impl Into<PathBuf>) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| fallback.into())
    }
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty()
        && !value.eq_ignore_ascii_case("0")
        && !value.eq_ignore_ascii_case("false")
        && !value.eq_ignore_ascii_case("no")
}
