//! Runner selection

use crate::error::{ForgeError, ForgeResult};
use crate::orchestration::bubblewrap::BubblewrapRunner;
use crate::orchestration::docker::DockerRunner;
use crate::orchestration::runner::Runner;

/// Names of all known runners, for error messages and CLI help
pub fn all_runners() -> Vec<&'static str> {
    vec!["bubblewrap", "docker"]
}

/// Construct a runner by name
pub fn runner_by_name(name: &str) -> ForgeResult<Box<dyn Runner>> {
    match name {
        "bubblewrap" => Ok(Box::new(BubblewrapRunner::new())),
        "docker" => Ok(Box::new(DockerRunner::new())),
        other => Err(ForgeError::RunnerUnusable {
            name: other.to_string(),
            available: all_runners().join(", "),
        }),
    }
}
