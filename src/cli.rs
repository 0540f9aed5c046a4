//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// DMQ node - gossip membership and broadcast messaging for SIP clusters
///
/// Joins a mesh of DMQ nodes, keeps the membership table converged through
/// periodic gossip, and dispatches inbound messages to local peers.
#[derive(Parser, Debug)]
#[command(name = "dmq-node")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node (listen, bootstrap, gossip)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "DMQ_CONFIG")]
        config: Option<String>,

        /// Listener address, overrides transport.listen_addr
        #[arg(short, long)]
        listen: Option<String>,

        /// Seed node URI (repeatable), overrides node.bootstrap_addresses
        #[arg(short, long = "bootstrap", value_name = "URI")]
        bootstrap: Vec<String>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["dmq-node", "run"]);
        match cli.command {
            Commands::Run { config, listen, bootstrap } => {
                assert!(config.is_none());
                assert!(listen.is_none());
                assert!(bootstrap.is_empty());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_overrides() {
        let cli = Cli::parse_from([
            "dmq-node",
            "run",
            "--config",
            "/etc/dmq-node/node.toml",
            "--listen",
            "127.0.0.1:5070",
            "--bootstrap",
            "sip:10.0.0.2:5060",
            "-b",
            "sip:10.0.0.3:5060",
        ]);
        match cli.command {
            Commands::Run { config, listen, bootstrap } => {
                assert_eq!(config.as_deref(), Some("/etc/dmq-node/node.toml"));
                assert_eq!(listen.as_deref(), Some("127.0.0.1:5070"));
                assert_eq!(bootstrap, vec!["sip:10.0.0.2:5060", "sip:10.0.0.3:5060"]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["dmq-node", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::parse_from(["dmq-node", "--quiet", "version"]);
        assert!(cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["dmq-node", "config", "init", "--force"]);
        match cli.command {
            Commands::Config { subcommand: ConfigSubcommand::Init { path, force } } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_config_validate() {
        let cli = Cli::parse_from(["dmq-node", "config", "validate", "-c", "node.toml"]);
        match cli.command {
            Commands::Config { subcommand: ConfigSubcommand::Validate { config } } => {
                assert_eq!(config.as_deref(), Some("node.toml"));
            }
            _ => panic!("Expected Config Validate command"),
        }
    }
}
