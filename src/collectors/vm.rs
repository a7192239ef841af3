use async_trait::async_trait;
use futures::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use super::{run, run_optional, Collector, CollectorError};
use crate::channel::privilege::shell_quote;
use crate::channel::CommandRunner;
use crate::state::{VmRecord, VmState};

lazy_static! {
    static ref TITLE: Regex = Regex::new(r"(?s)<title>(.*?)</title>").expect("valid title pattern");
}

/// Rows of `virsh list --all` after the two header lines. The state column
/// may contain spaces (`shut off`).
pub fn parse_vm_list(raw: &str) -> Vec<VmRecord> {
    raw.lines()
        .skip(2)
        .filter_map(|line| {
            let (id, rest) = line.trim().split_once(char::is_whitespace)?;
            let (name, state) = rest.trim_start().split_once(char::is_whitespace)?;
            let state = state.trim();
            Some(VmRecord {
                id: id.to_string(),
                name: name.to_string(),
                title: name.to_string(),
                state: VmState::from_virsh(state),
            })
        })
        .collect()
}

pub fn parse_title(xml: &str) -> Option<String> {
    TITLE
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty())
}

#[derive(Default)]
pub struct VmCollector;

async fn title_for(runner: &dyn CommandRunner, name: &str) -> String {
    let command = format!("virsh dumpxml {}", shell_quote(name));
    match run_optional(runner, &command).await.as_deref().and_then(parse_title) {
        Some(title) => title,
        None => {
            debug!(vm = name, "no vm title, using name");
            name.to_string()
        }
    }
}

#[async_trait]
impl Collector for VmCollector {
    type Record = Vec<VmRecord>;

    fn name(&self) -> &'static str {
        "vm"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Vec<VmRecord>, CollectorError> {
        let listing = run(runner, "virsh list --all").await?;
        let mut vms = parse_vm_list(&listing);
        let titles = join_all(vms.iter().map(|vm| title_for(runner, &vm.name))).await;
        for (vm, title) in vms.iter_mut().zip(titles) {
            vm.title = title;
        }
        Ok(vms)
    }
}
