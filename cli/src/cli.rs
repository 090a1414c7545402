pub mod opts;
pub mod subs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use launchpad_lib::{
    chef::{ChefSolo, LogLevel},
    cluster::{select_nodes, BatchReport, Coordinator, Provisioning},
    gateway::{Ec2Gateway, Gateway},
    known_hosts::KnownHosts,
    poll::PollOptions,
    provision::Provisioner,
    ssh::{KeyScan, OpenSsh, Remote},
    types::{Cluster, Node},
};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use opts::Launchpad;
use subs::SubCommands;

/// Everything a command needs, built once from the global options.
struct Session {
    coordinator: Coordinator,
    chef: ChefSolo,
}

impl Session {
    fn new(opts: &Launchpad, cancel: CancellationToken) -> Self {
        let known_hosts_path = opts
            .known_hosts
            .clone()
            .unwrap_or_else(KnownHosts::default_path);

        let gateway: Arc<dyn Gateway> = Arc::new(Ec2Gateway::new(opts.region.clone()));
        let remote: Arc<dyn Remote> =
            Arc::new(OpenSsh::default().with_known_hosts(&known_hosts_path));
        let known_hosts = Arc::new(KnownHosts::new(
            &known_hosts_path,
            Arc::new(KeyScan::default()),
        ));

        let poll = PollOptions::every(Duration::from_secs(opts.poll_interval))
            .with_timeout(opts.poll_timeout.map(Duration::from_secs));
        let provisioner = Provisioner::new(
            Arc::clone(&gateway),
            Arc::clone(&remote),
            Arc::clone(&known_hosts),
            poll,
            cancel,
        );

        Session {
            coordinator: Coordinator::new(gateway, known_hosts, provisioner, opts.parallel),
            chef: ChefSolo::new(&opts.chef_dir, remote),
        }
    }
}

pub(crate) async fn run(mut opts: Launchpad) -> Result<()> {
    let cluster = Cluster::load(&opts.cluster_file).with_context(|| {
        format!(
            "couldn't load cluster from {}",
            opts.cluster_file.display()
        )
    })?;
    info!("cluster {} has {} nodes", cluster.name, cluster.nodes.len());

    let command = opts.commands.take().unwrap_or_default();
    let nodes = select_nodes(&cluster, only(&command))?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(cancel.clone()));
    let ctx = Session::new(&opts, cancel);

    match command {
        SubCommands::All(sub) => {
            let provisioning = start(&ctx, nodes).await?;
            let provisioned = finish(&provisioning.report);
            if provisioning.ready.is_empty() {
                return provisioned;
            }
            let configured = chef(&ctx, &provisioning.ready, level(sub.debug)).await;
            provisioned.and(configured)
        }
        SubCommands::Start(_) => {
            let provisioning = start(&ctx, nodes).await?;
            finish(&provisioning.report)
        }
        SubCommands::Chef(sub) => chef(&ctx, &nodes, level(sub.debug)).await,
        SubCommands::UpdateKnownHosts(_) => {
            let report = ctx.coordinator.refresh_known_hosts(&nodes).await?;
            finish(&report)
        }
        SubCommands::UpdateChef(_) => {
            let report = ctx.coordinator.update_chef(&nodes, &ctx.chef).await?;
            finish(&report)
        }
    }
}

async fn start(ctx: &Session, nodes: Vec<Node>) -> Result<Provisioning> {
    ctx.coordinator
        .run_provisioning(nodes)
        .await
        .context("couldn't provision the cluster")
}

async fn chef(ctx: &Session, nodes: &[Node], level: LogLevel) -> Result<()> {
    let report = ctx
        .coordinator
        .run_configuration(nodes, &ctx.chef, level)
        .await
        .context("couldn't run chef")?;
    finish(&report)
}

fn finish(report: &BatchReport) -> Result<()> {
    report.print();
    let failed = report.failures().count();
    if failed > 0 {
        bail!(
            "{}: {} of {} nodes failed",
            report.action,
            failed,
            report.nodes.len()
        );
    }
    Ok(())
}

fn only(command: &SubCommands) -> Option<&str> {
    match command {
        SubCommands::All(sub) | SubCommands::Chef(sub) => sub.hosts.only.as_deref(),
        SubCommands::Start(sub)
        | SubCommands::UpdateKnownHosts(sub)
        | SubCommands::UpdateChef(sub) => sub.only.as_deref(),
    }
}

fn level(debug: bool) -> LogLevel {
    if debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, abandoning nodes still in flight");
        cancel.cancel();
    }
}
