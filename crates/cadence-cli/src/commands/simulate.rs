use anyhow::{Context, Result, bail};
use cadence_core::promotion::PromotionOutcome;
use cadence_core::testing::LocalCluster;
use cadence_core::{ClusterEvent, CoordinatorConfig, CoordinatorDump, LateResponsePolicy, ResponseStatus, SiteId};
use clap::{Args, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;

use super::OutputContext;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// No failures
    Steady,
    /// The leader dies mid-stream and a survivor is promoted
    LeaderFailure,
    /// A replica dies mid-stream
    ReplicaFailure,
    /// Leadership is handed to another replica mid-stream
    Migration,
    /// One replica computes different results
    Nondeterminism,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LatePolicy {
    /// Count and drop responses from departed replicas
    Discard,
    /// Stop the partition on a response from a departed replica
    Fatal,
}

impl From<LatePolicy> for LateResponsePolicy {
    fn from(policy: LatePolicy) -> Self {
        match policy {
            LatePolicy::Discard => LateResponsePolicy::Discard,
            LatePolicy::Fatal => LateResponsePolicy::Fatal,
        }
    }
}

#[derive(Args, Clone)]
pub struct SimulateArgs {
    /// Scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::Steady)]
    pub scenario: Scenario,

    /// Replicas of the partition
    #[arg(long, default_value_t = 3)]
    pub sites: u32,

    /// Partition id
    #[arg(long, default_value_t = 1)]
    pub partition: u16,

    /// Client writes to submit
    #[arg(long, default_value_t = 20)]
    pub writes: usize,

    /// RNG seed; random when omitted
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the configured late-response policy
    #[arg(long, value_enum)]
    pub late_response: Option<LatePolicy>,

    /// Include every site's coordinator dump in the report
    #[arg(long)]
    pub dump: bool,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub scenario: Scenario,
    pub seed: u64,
    pub partition: u16,
    pub leader: Option<SiteId>,
    pub live_sites: Vec<SiteId>,
    pub submitted: usize,
    pub committed: usize,
    pub aborted: usize,
    pub ignored: usize,
    pub unanswered: usize,
    /// Every live site applied the same handles in the same order
    pub converged: bool,
    pub applied: BTreeMap<String, usize>,
    pub promotion: Option<PromotionOutcome>,
    pub events: Vec<ClusterEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dumps: Option<Vec<CoordinatorDump>>,
}

/// Run `args.scenario` on an in-process cluster
pub fn run(args: &SimulateArgs, template: &CoordinatorConfig, seed: u64) -> Result<SimulationReport> {
    if args.scenario != Scenario::Steady && args.sites < 2 {
        bail!("scenario {:?} needs at least two sites", args.scenario);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let policy = args
        .late_response
        .map(LateResponsePolicy::from)
        .unwrap_or(template.late_response_policy);
    let mut cluster = LocalCluster::with_config(args.partition, args.sites, |c| {
        CoordinatorConfig {
            partition: c.partition,
            site: c.site,
            ..template.clone()
        }
        .with_late_response_policy(policy)
    })?;
    tracing::info!(scenario = ?args.scenario, seed, sites = args.sites, writes = args.writes, "Starting simulation");

    if args.scenario == Scenario::Nondeterminism {
        let odd_one = LocalCluster::site(args.sites - 1);
        cluster.node(odd_one)?.engine.set_salt(Some(rng.gen_range(1..u32::MAX)));
    }

    for i in 0..args.writes {
        let key = rng.gen_range(0..1_000);
        let payload = if rng.gen_bool(0.1) {
            format!("abort k{}", key)
        } else {
            format!("insert k{}={};update n{}", key, i, i % 7)
        };
        cluster.submit(&payload);
    }

    // Let a random prefix of the traffic through before disrupting it.
    let prefix = rng.gen_range(0..=args.writes * 3);
    for _ in 0..prefix {
        if !cluster.step()? {
            break;
        }
    }

    let mut promotion = None;
    match args.scenario {
        Scenario::Steady | Scenario::Nondeterminism => {}
        Scenario::ReplicaFailure => {
            cluster.fail_site(LocalCluster::site(args.sites - 1))?;
        }
        Scenario::LeaderFailure => {
            let leader = cluster.leader().context("partition has no leader")?;
            cluster.fail_site(leader)?;
            let successor = *cluster
                .live_sites()
                .first()
                .context("no survivor to promote")?;
            tracing::info!(%leader, %successor, "Leader failed; promoting successor");
            promotion = Some(cluster.promote(successor, false)?);
        }
        Scenario::Migration => {
            cluster.migrate(LocalCluster::site(1))?;
        }
    }
    cluster.pump().context("partition stopped")?;

    let promotion = match promotion.as_mut().and_then(|p| p.try_outcome()) {
        Some(outcome) => Some(outcome?),
        None => None,
    };

    let live_sites = cluster.live_sites();
    let mut applied = BTreeMap::new();
    let mut reference: Option<Vec<cadence_core::TxnHandle>> = None;
    let mut converged = true;
    for site in &live_sites {
        let handles = cluster.applied(*site)?;
        applied.insert(site.to_string(), handles.len());
        match &reference {
            Some(expected) => converged &= *expected == handles,
            None => reference = Some(handles),
        }
    }

    let responses = cluster.responses();
    let count = |status: ResponseStatus| responses.iter().filter(|r| r.status == status).count();
    let dumps = args.dump.then(|| {
        live_sites
            .iter()
            .filter_map(|s| cluster.node(*s).ok())
            .map(|n| n.coordinator.dump())
            .collect()
    });

    Ok(SimulationReport {
        scenario: args.scenario,
        seed,
        partition: args.partition,
        leader: cluster.leader(),
        live_sites,
        submitted: args.writes,
        committed: count(ResponseStatus::Committed),
        aborted: count(ResponseStatus::Aborted),
        ignored: count(ResponseStatus::Ignored),
        unanswered: args.writes.saturating_sub(responses.len()),
        converged,
        applied,
        promotion,
        events: cluster.events(),
        dumps,
    })
}

pub fn execute(args: SimulateArgs, config_path: Option<&str>, output: &OutputContext) -> Result<()> {
    let template = match config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            CoordinatorConfig::from_toml_str(&text)?
        }
        None => CoordinatorConfig::default(),
    };
    let seed = args
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(0..u64::MAX));
    let report = run(&args, &template, seed)?;

    if output.json {
        output.print_json(&report)?;
    } else {
        output.print_table(
            &["scenario", "seed", "leader", "committed", "aborted", "ignored", "unanswered", "converged"],
            &[vec![
                format!("{:?}", report.scenario),
                report.seed.to_string(),
                report.leader.map(|l| l.to_string()).unwrap_or_else(|| "-".into()),
                report.committed.to_string(),
                report.aborted.to_string(),
                report.ignored.to_string(),
                report.unanswered.to_string(),
                report.converged.to_string(),
            ]],
        )?;
        if let Some(outcome) = &report.promotion {
            output.print_info(&format!(
                "promotion {}: repaired {} entries, allocating above {}",
                outcome.request_id, outcome.repaired, outcome.max_handle
            ));
        }
        for event in &report.events {
            output.print_info(&format!("event: {:?}", event));
        }
        if output.verbose {
            for (site, count) in &report.applied {
                output.print_info(&format!("site {} applied {}", site, count));
            }
        }
    }

    if !report.converged {
        output.print_error("live replicas diverged");
        bail!("simulation seed {} did not converge", report.seed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(scenario: Scenario) -> SimulateArgs {
        SimulateArgs {
            scenario,
            sites: 3,
            partition: 4,
            writes: 12,
            seed: None,
            late_response: None,
            dump: false,
        }
    }

    #[test]
    fn test_every_scenario_converges() {
        let template = CoordinatorConfig::default();
        for scenario in [
            Scenario::Steady,
            Scenario::LeaderFailure,
            Scenario::ReplicaFailure,
            Scenario::Migration,
            Scenario::Nondeterminism,
        ] {
            for seed in 0..8 {
                let report = run(&args(scenario), &template, seed).unwrap();
                assert!(report.converged, "{:?} seed {}", scenario, seed);
                assert!(report.leader.is_some(), "{:?} seed {}", scenario, seed);
            }
        }
    }

    #[test]
    fn test_steady_answers_everything() {
        let report = run(&args(Scenario::Steady), &CoordinatorConfig::default(), 3).unwrap();
        assert_eq!(report.unanswered, 0);
        assert_eq!(report.committed + report.aborted, 12);
        assert!(report.events.is_empty());
    }

    #[test]
    fn test_nondeterminism_is_reported() {
        let report = run(&args(Scenario::Nondeterminism), &CoordinatorConfig::default(), 5).unwrap();
        assert!(
            report
                .events
                .iter()
                .any(|e| matches!(e, ClusterEvent::Nondeterminism { .. }))
        );
    }

    #[test]
    fn test_same_seed_same_report() {
        let template = CoordinatorConfig::default();
        let a = run(&args(Scenario::LeaderFailure), &template, 42).unwrap();
        let b = run(&args(Scenario::LeaderFailure), &template, 42).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_failure_scenarios_need_two_sites() {
        let mut one = args(Scenario::LeaderFailure);
        one.sites = 1;
        assert!(run(&one, &CoordinatorConfig::default(), 1).is_err());
    }
}
