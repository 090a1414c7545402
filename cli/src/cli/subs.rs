use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum SubCommands {
    All(Chef),
    Start(Hosts),
    Chef(Chef),
    UpdateKnownHosts(Hosts),
    UpdateChef(Hosts),
}

impl Default for SubCommands {
    fn default() -> Self {
        SubCommands::All(Chef::default())
    }
}

#[derive(Args, Default)]
pub struct Hosts {
    #[clap(
        long = "host",
        short = 'H',
        alias = "server",
        help = "only these nodes, comma separated",
        value_name = "NAMES"
    )]
    pub only: Option<String>,
}

#[derive(Args, Default)]
pub struct Chef {
    #[clap(flatten)]
    pub hosts: Hosts,
    #[clap(long, short, help = "run chef with log level debug")]
    pub debug: bool,
}
