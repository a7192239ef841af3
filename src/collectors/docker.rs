use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{run, run_optional, Collector, CollectorError};
use crate::channel::privilege::shell_quote;
use crate::channel::CommandRunner;
use crate::state::{ContainerRecord, ContainerState};

const TITLE_LABEL: &str = "org.opencontainers.image.title";

/// One line of `docker ps -a --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Image", default)]
    image: String,
}

pub fn parse_ps(raw: &str) -> Vec<ContainerRecord> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<PsRow>(line) {
            Ok(row) => Some(row),
            Err(err) => {
                warn!(line, error = %err, "unparseable docker ps row");
                None
            }
        })
        .map(|row| ContainerRecord {
            title: row.names.clone(),
            id: row.id,
            name: row.names,
            image: row.image,
            state: ContainerState::from_docker(&row.state),
        })
        .collect()
}

fn parse_title(raw: &str) -> Option<String> {
    let title = raw.trim();
    (!title.is_empty() && title != "<no value>").then(|| title.to_string())
}

async fn title_for(runner: &dyn CommandRunner, name: &str) -> String {
    let command = format!(
        "docker inspect --format '{{{{ index .Config.Labels \"{TITLE_LABEL}\" }}}}' {}",
        shell_quote(name)
    );
    match run_optional(runner, &command).await.as_deref().and_then(parse_title) {
        Some(title) => title,
        None => {
            debug!(container = name, "no image title label, using name");
            name.to_string()
        }
    }
}

#[derive(Default)]
pub struct DockerCollector;

#[async_trait]
impl Collector for DockerCollector {
    type Record = Vec<ContainerRecord>;

    fn name(&self) -> &'static str {
        "docker"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Vec<ContainerRecord>, CollectorError> {
        let listing = run(runner, "docker ps -a --format '{{json .}}'").await?;
        let mut containers = parse_ps(&listing);
        let titles = join_all(containers.iter().map(|c| title_for(runner, &c.name))).await;
        for (container, title) in containers.iter_mut().zip(titles) {
            container.title = title;
        }
        Ok(containers)
    }
}
