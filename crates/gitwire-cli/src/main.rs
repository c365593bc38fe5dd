//! gitwire CLI - talk to git servers over the smart protocol.

use anyhow::Context;
use clap::{Parser, Subcommand};
use gitwire_protocol::ConversationConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod transport;

use transport::Remote;

/// gitwire - git smart-protocol client
#[derive(Parser, Debug)]
#[command(name = "gitwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// YAML file with conversation settings
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// git daemon host; without it the repository is a local path
    #[arg(long, global = true)]
    host: Option<String>,

    /// git daemon port
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List advertised refs
    LsRemote {
        /// Repository path
        repository: String,
    },

    /// Fetch refs (HEAD's branch by default)
    ///
    /// The built-in pack decoder does not resolve deltas, so servers that
    /// deltify the requested history make the fetch fail. Use `--depth 1`
    /// to fetch only the tip commits.
    Fetch {
        /// Repository path
        repository: String,
        /// Short ref names to fetch
        refs: Vec<String>,
        /// Limit history to this many commits
        #[arg(long)]
        depth: Option<u32>,
    },

    /// Commit a file as the only content of a branch and push it
    CommitFile {
        /// Repository path
        repository: String,
        /// Branch to update or create
        branch: String,
        /// File to commit
        file: PathBuf,
        /// Commit message
        #[arg(short, long, default_value = "Update via gitwire")]
        message: String,
        /// Author as `Name <email>`
        #[arg(long, default_value = "gitwire <gitwire@localhost>")]
        author: String,
    },

    /// Delete a remote branch or tag
    Delete {
        /// Repository path
        repository: String,
        /// Short ref name
        name: String,
    },

    /// Show version information
    Version,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ConversationConfig> {
    let Some(path) = path else {
        return Ok(ConversationConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    let remote = |repository: String| Remote::new(repository, cli.host.clone(), cli.port);

    match cli.command {
        Commands::LsRemote { repository } => {
            commands::ls_remote(&remote(repository), config).await?;
        }
        Commands::Fetch {
            repository,
            refs,
            depth,
        } => {
            if depth.is_some() {
                config.depth = depth;
            }
            commands::fetch(&remote(repository), &refs, config).await?;
        }
        Commands::CommitFile {
            repository,
            branch,
            file,
            message,
            author,
        } => {
            commands::commit_file(&remote(repository), &branch, &file, &message, &author, config)
                .await?;
        }
        Commands::Delete { repository, name } => {
            commands::delete(&remote(repository), &name, config).await?;
        }
        Commands::Version => {
            println!("gitwire {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("gitwire_cli={log_level},gitwire_protocol={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
