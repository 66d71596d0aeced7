use anyhow::{Context, Result};
use cadence_core::TopologyConfig;
use cadence_core::topology::{ClusterDirectory, CoordinationService};
use clap::{Args, Subcommand};

use super::OutputContext;

#[derive(Args)]
pub struct TopologyArgs {
    /// Topology file (TOML)
    #[arg(long, short)]
    pub file: String,

    #[command(subcommand)]
    pub command: TopologyCommand,
}

#[derive(Subcommand)]
pub enum TopologyCommand {
    /// List partition placements
    Show,
    /// Suggest one leadership move that evens out leaders per host
    PlanMigration,
}

pub fn load_directory(path: &str) -> Result<ClusterDirectory> {
    let config = TopologyConfig::load(path).with_context(|| format!("loading topology {}", path))?;
    Ok(ClusterDirectory::from_config(&config)?)
}

pub fn execute(args: TopologyArgs, output: &OutputContext) -> Result<()> {
    let directory = load_directory(&args.file)?;
    match args.command {
        TopologyCommand::Show => {
            let live = directory.live_sites();
            let rows: Vec<Vec<String>> = directory
                .placements()
                .into_iter()
                .map(|p| {
                    let replicas: Vec<String> = p
                        .replicas
                        .iter()
                        .map(|s| {
                            if live.contains(s) {
                                s.to_string()
                            } else {
                                format!("{} (down)", s)
                            }
                        })
                        .collect();
                    vec![
                        p.partition.to_string(),
                        p.leader.map(|l| l.to_string()).unwrap_or_else(|| "-".into()),
                        replicas.join(", "),
                    ]
                })
                .collect();
            output.print_table(&["partition", "leader", "replicas"], &rows)
        }
        TopologyCommand::PlanMigration => match directory.migration_target() {
            Some(plan) => {
                if output.json {
                    output.print_json(&plan)
                } else {
                    output.print_info(&format!(
                        "move partition {} leadership from {} to {}",
                        plan.partition, plan.from, plan.to
                    ));
                    Ok(())
                }
            }
            None => {
                if output.json {
                    output.print_json(&serde_json::Value::Null)
                } else {
                    output.print_info("leaders are balanced; nothing to migrate");
                    Ok(())
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::SiteId;
    use std::io::Write;

    const UNBALANCED: &str = r#"
[[partitions]]
id = 0
leader = "0:0"
replicas = ["0:0", "1:0"]

[[partitions]]
id = 1
leader = "0:1"
replicas = ["0:1", "1:1"]

[[partitions]]
id = 2
leader = "0:2"
replicas = ["0:2", "1:2"]
"#;

    #[test]
    fn test_load_and_plan() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(UNBALANCED.as_bytes()).unwrap();
        let directory = load_directory(file.path().to_str().unwrap()).unwrap();

        assert_eq!(directory.placements().len(), 3);
        let plan = directory.migration_target().expect("host 0 leads everything");
        assert_eq!(plan.from.host(), 0);
        assert_eq!(plan.to.host(), 1);
        assert_eq!(directory.leader_of(plan.partition), Some(plan.from));
        assert!(directory.live_sites().contains(&SiteId::new(1, 0)));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_directory("/nonexistent/topology.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/topology.toml"));
    }
}
