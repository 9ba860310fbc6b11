//! cm - Container-Maker environment manager CLI

mod commands;

use clap::{Args, Parser, Subcommand};
use cm_config::GlobalConfig;
use cm_core::{format_user_error, CoreError, EnvironmentManager, EnvironmentStatus, SortBy};
use cm_provider::ProviderType;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cm")]
#[command(author, version, about = "Container-Maker environment manager", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override default provider (docker or podman)
    #[arg(long, global = true)]
    provider: Option<ProviderType>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage isolated development environments
    #[command(subcommand)]
    Env(EnvCommand),
}

#[derive(Subcommand)]
enum EnvCommand {
    /// Create an environment (and start it unless --no-start)
    Create(CreateArgs),

    /// Start an environment
    Start {
        /// Environment name or ID
        name: String,
    },

    /// Stop an environment
    Stop {
        /// Environment name or ID
        name: String,
        /// Seconds to wait before killing the container
        #[arg(short, long)]
        timeout: Option<u32>,
    },

    /// Restart an environment
    Restart {
        /// Environment name or ID
        name: String,
    },

    /// Delete an environment, its container and its network
    #[command(alias = "rm")]
    Delete {
        /// Environment name or ID
        name: String,
        /// Stop it first if running
        #[arg(short, long)]
        force: bool,
    },

    /// List environments
    #[command(alias = "ls")]
    List {
        /// Only environments with this status
        #[arg(long)]
        status: Option<EnvironmentStatus>,
        /// Only environments for this project directory
        #[arg(long)]
        project: Option<PathBuf>,
        /// Only environments carrying this tag
        #[arg(long)]
        tag: Option<String>,
        /// Sort by name or created
        #[arg(long, default_value = "name")]
        sort: SortBy,
        /// Reverse the order
        #[arg(long)]
        desc: bool,
        /// Show at most this many
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Make an environment the active one
    Switch {
        /// Environment name or ID
        name: String,
    },

    /// Show the active environment
    Active,

    /// Let two environments reach each other by name
    Link {
        env1: String,
        env2: String,
        /// Record the link on both environments
        #[arg(short, long)]
        bidirectional: bool,
    },

    /// Remove a link between two environments
    Unlink { env1: String, env2: String },

    /// Open an interactive shell, starting the environment if needed
    Shell {
        /// Environment name or ID (the active environment if not specified)
        name: Option<String>,
        /// Shell to run instead of the configured default
        #[arg(short, long)]
        shell: Option<String>,
    },

    /// Run a command in a running environment
    Exec {
        /// Environment name or ID
        name: String,
        /// Command to run
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// Remove orphaned environments and unused networks
    Prune {
        /// Also remove environments in error state
        #[arg(short, long)]
        all: bool,
    },
}

#[derive(Args)]
struct CreateArgs {
    /// Environment name
    name: String,
    /// Project directory (defaults to the current directory)
    #[arg(short = 'd', long = "dir")]
    project_dir: Option<PathBuf>,
    /// Template used when the project has no devcontainer.json
    #[arg(short, long)]
    template: Option<String>,
    /// Additional container port to forward (repeatable)
    #[arg(short, long = "port")]
    ports: Vec<u16>,
    /// Link to an existing environment (repeatable)
    #[arg(short, long = "link")]
    links: Vec<String>,
    /// GPU device IDs, comma separated
    #[arg(long, value_delimiter = ',')]
    gpus: Vec<u32>,
    /// Number of GPUs when no device IDs are given
    #[arg(long)]
    gpu_count: Option<u32>,
    /// Memory limit, e.g. 512m or 8g
    #[arg(long)]
    memory: Option<String>,
    /// CPU limit, e.g. 1.5
    #[arg(long)]
    cpu: Option<f64>,
    /// Create without starting
    #[arg(long)]
    no_start: bool,
    /// Replace an existing environment with the same name
    #[arg(short, long)]
    force: bool,
    /// KEY=VALUE label (repeatable)
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,
    /// Tag (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<CoreError>() {
            Some(core) => eprint!("{}", format_user_error(core)),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match GlobalConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Using default configuration: {}", e);
            GlobalConfig::default()
        }
    };

    let Commands::Env(command) = cli.command;
    let manager = EnvironmentManager::connect(config, cli.provider).await?;

    match command {
        EnvCommand::Create(args) => commands::create(&manager, args.into_options()).await?,
        EnvCommand::Start { name } => commands::start(&manager, &name).await?,
        EnvCommand::Stop { name, timeout } => commands::stop(&manager, &name, timeout).await?,
        EnvCommand::Restart { name } => commands::restart(&manager, &name).await?,
        EnvCommand::Delete { name, force } => commands::delete(&manager, &name, force).await?,
        EnvCommand::List {
            status,
            project,
            tag,
            sort,
            desc,
            limit,
        } => {
            let opts = cm_core::ListOptions {
                status,
                project,
                tag,
                sort_by: sort,
                desc,
                limit,
            };
            commands::list(&manager, &opts).await?
        }
        EnvCommand::Switch { name } => commands::switch(&manager, &name).await?,
        EnvCommand::Active => commands::active(&manager).await?,
        EnvCommand::Link {
            env1,
            env2,
            bidirectional,
        } => commands::link(&manager, &env1, &env2, bidirectional).await?,
        EnvCommand::Unlink { env1, env2 } => commands::unlink(&manager, &env1, &env2).await?,
        EnvCommand::Shell { name, shell } => {
            commands::shell(&manager, name.as_deref(), shell.as_deref()).await?
        }
        EnvCommand::Exec { name, cmd } => commands::exec(&manager, &name, cmd).await?,
        EnvCommand::Prune { all } => commands::prune(&manager, all).await?,
    }

    Ok(())
}

impl CreateArgs {
    fn into_options(self) -> cm_core::CreateOptions {
        cm_core::CreateOptions {
            project_dir: self.project_dir,
            template: self.template,
            expose_ports: self.ports,
            link_to: self.links,
            gpus: self.gpus,
            gpu_count: self.gpu_count,
            memory: self.memory,
            cpu: self.cpu,
            no_start: self.no_start,
            force: self.force,
            labels: self.labels.into_iter().collect(),
            tags: self.tags,
            ..cm_core::CreateOptions::new(self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(
            parse_label("team=infra").unwrap(),
            ("team".to_string(), "infra".to_string())
        );
        assert_eq!(
            parse_label("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_label("=x").is_err());
        assert!(parse_label("novalue").is_err());
    }

    #[test]
    fn test_create_args_map_to_options() {
        let cli = Cli::try_parse_from([
            "cm", "env", "create", "web", "--port", "3000", "-p", "9229", "--link", "db",
            "--gpus", "0,1", "--memory", "8g", "--label", "team=infra", "--tag", "frontend",
            "--no-start",
        ])
        .unwrap();

        let Commands::Env(EnvCommand::Create(args)) = cli.command else {
            panic!("expected env create");
        };
        let opts = args.into_options();
        assert_eq!(opts.name, "web");
        assert_eq!(opts.expose_ports, vec![3000, 9229]);
        assert_eq!(opts.link_to, vec!["db"]);
        assert_eq!(opts.gpus, vec![0, 1]);
        assert_eq!(opts.memory.as_deref(), Some("8g"));
        assert_eq!(opts.labels.get("team").map(String::as_str), Some("infra"));
        assert_eq!(opts.tags, vec!["frontend"]);
        assert!(opts.no_start);
        assert!(!opts.force);
    }

    #[test]
    fn test_exec_keeps_command_flags() {
        let cli = Cli::try_parse_from(["cm", "env", "exec", "web", "ls", "-la", "/tmp"]).unwrap();
        let Commands::Env(EnvCommand::Exec { name, cmd }) = cli.command else {
            panic!("expected env exec");
        };
        assert_eq!(name, "web");
        assert_eq!(cmd, vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn test_list_filters_parse() {
        let cli = Cli::try_parse_from([
            "cm", "env", "list", "--status", "running", "--sort", "created", "--desc",
        ])
        .unwrap();
        let Commands::Env(EnvCommand::List {
            status, sort, desc, ..
        }) = cli.command
        else {
            panic!("expected env list");
        };
        assert_eq!(status, Some(EnvironmentStatus::Running));
        assert_eq!(sort, SortBy::Created);
        assert!(desc);

        assert!(Cli::try_parse_from(["cm", "env", "list", "--status", "sleeping"]).is_err());
    }
}
