//! Command implementations

pub mod apply;
pub mod output;
pub mod plan;
pub mod state;

use anyhow::Result;
use declarative::{DependencyGraph, Direction, FsLoader, Target};

use crate::Context;
use crate::config::StratumConfig;
use crate::state::FileStateStore;

/// Configuration and recorded state, loaded once per command
pub struct Workspace {
    pub config: StratumConfig,
    pub state: FileStateStore,
}

impl Workspace {
    pub fn load(ctx: &Context) -> Result<Self> {
        let config = StratumConfig::load(&ctx.config, &FsLoader)?;
        let state = FileStateStore::open(config.state_path())?;
        Ok(Self { config, state })
    }

    /// Dependency graph of the configuration, narrowed to `target` if given
    pub fn graph(&self, target: Option<&str>, direction: Direction) -> Result<DependencyGraph> {
        let graph = DependencyGraph::from_configuration(&self.config.configuration)?;
        let Some(raw) = target else {
            return Ok(graph);
        };

        let target: Target = raw.parse()?;
        let selected = graph.select(&target, direction)?;
        log::info!(
            "Target {target} selects {} of {} resource(s)",
            selected.len(),
            graph.len()
        );
        Ok(selected)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub const CONFIG: &str = r#"
[settings]
jobs = 2
account = "account.toml"

[user.lb]
name = "loadbalancer"
path = "/system/"

[policy.lb_ro]
name = "lb-ro"
policy = { file = "lb_ro.json" }

[user_policy_attachment.lb_ro]
user = "${user.lb.name}"
policy_arn = "${policy.lb_ro.arn}"

[access_key.lb]
user = "${user.lb.name}"

[output.lb_arn]
value = "${user.lb.arn}"

[output.lb_key_id]
value = "${access_key.lb.id}"
"#;

    /// A directory holding a config, its policy document and nothing else
    pub fn workspace_dir(config: &str) -> (TempDir, Context) {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("lb_ro.json"),
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":["ec2:Describe*"],"Resource":"*"}]}"#,
        )
        .unwrap();
        let path: PathBuf = dir.path().join("stratum.toml");
        fs::write(&path, config).unwrap();
        let ctx = Context {
            verbose: 0,
            quiet: true,
            config: path,
        };
        (dir, ctx)
    }
}
