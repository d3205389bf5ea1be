use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::Host;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one info request to a single server and print the answers.
    Info(InfoArgs),
    /// Discover the cluster from a seed and print its topology as JSON.
    Tend(TendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InfoArgs {
    /// Server to query, as host or host:port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub host: Host,

    /// Names to request. Defaults to the server's node name.
    #[arg(default_values_t = vec!["node".to_string()])]
    pub names: Vec<String>,

    /// Give up after this many milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct TendArgs {
    /// Seed host, as host or host:port. Repeat for several seeds.
    #[arg(long = "seed", required = true)]
    pub seeds: Vec<Host>,

    /// Number of tend cycles to run before printing.
    #[arg(long, default_value_t = 2)]
    pub cycles: u32,

    /// Timeout for each info exchange, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub info_timeout_ms: u64,
}

impl InfoArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TendArgs {
    pub fn info_timeout(&self) -> Duration {
        Duration::from_millis(self.info_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tend_with_several_seeds() {
        let cli = Cli::try_parse_from([
            "cluster-info",
            "tend",
            "--seed",
            "10.0.0.1",
            "--seed",
            "db2:3100",
        ])
        .unwrap();
        let Command::Tend(args) = cli.command else {
            panic!("expected tend");
        };
        assert_eq!(args.seeds, vec![Host::new("10.0.0.1", 3000), Host::new("db2", 3100)]);
        assert_eq!(args.cycles, 2);
    }

    #[test]
    fn info_defaults_to_node_name() {
        let cli = Cli::try_parse_from(["cluster-info", "info"]).unwrap();
        let Command::Info(args) = cli.command else {
            panic!("expected info");
        };
        assert_eq!(args.names, vec!["node"]);
        assert_eq!(args.host, Host::new("127.0.0.1", 3000));
    }
}
