pub mod disk;
pub mod docker;
pub mod extract;
pub mod system;
pub mod ups;
pub mod vm;

use async_trait::async_trait;
use thiserror::Error;

use crate::channel::{CommandError, CommandRunner};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("`{command}` failed: {source}")]
    Command {
        command: String,
        #[source]
        source: CommandError,
    },
    #[error("unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },
}

/// One section of the snapshot. Collectors degrade individual fields to
/// unknown on parse trouble and only fail when the section as a whole could
/// not be read.
#[async_trait]
pub trait Collector: Send + Sync {
    type Record: Send;

    fn name(&self) -> &'static str;

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Self::Record, CollectorError>;
}

pub(crate) async fn run(runner: &dyn CommandRunner, command: &str) -> Result<String, CollectorError> {
    runner
        .run(command)
        .await
        .map_err(|source| CollectorError::Command {
            command: command.to_string(),
            source,
        })
}

pub(crate) async fn run_optional(runner: &dyn CommandRunner, command: &str) -> Option<String> {
    match runner.run(command).await {
        Ok(out) if !out.trim().is_empty() => Some(out),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(command, error = %err, "optional command failed");
            None
        }
    }
}
