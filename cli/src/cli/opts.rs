use std::path::PathBuf;

use clap::Parser;
use rusoto_core::Region;

use super::subs::SubCommands;

#[derive(Parser)]
#[clap(author, version, about)]
pub struct Launchpad {
    #[clap(
        long,
        help = "The JSON file declaring the cluster and its nodes",
        env = "LAUNCHPAD_CLUSTER",
        value_name = "FILE",
        default_value = "cluster.json"
    )]
    pub cluster_file: PathBuf,
    #[clap(
        long,
        help = "The AWS region the nodes live in",
        env = "AWS_DEFAULT_REGION",
        value_name = "REGION",
        default_value = "us-east-1"
    )]
    pub region: Region,
    #[clap(
        long,
        help = "The known_hosts file to keep in sync [default: ~/.ssh/known_hosts]",
        env = "LAUNCHPAD_KNOWN_HOSTS",
        value_name = "PATH"
    )]
    pub known_hosts: Option<PathBuf>,
    #[clap(
        long,
        short,
        help = "How many nodes to provision at once",
        env = "LAUNCHPAD_PARALLEL",
        value_name = "NODES",
        default_value = "4"
    )]
    pub parallel: usize,
    #[clap(
        long,
        help = "Seconds between checks while waiting for an instance to start",
        value_name = "SECONDS",
        default_value = "10"
    )]
    pub poll_interval: u64,
    #[clap(
        long,
        help = "Give up waiting for an instance to start after this many seconds",
        value_name = "SECONDS"
    )]
    pub poll_timeout: Option<u64>,
    #[clap(
        long,
        help = "Directory holding solo.rb, cookbooks and nodes/<name>.json",
        value_name = "DIR",
        default_value = "chef"
    )]
    pub chef_dir: PathBuf,
    #[clap(subcommand)]
    pub commands: Option<SubCommands>,
}
