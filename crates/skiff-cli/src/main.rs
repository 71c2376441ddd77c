mod cmd;
mod format;
mod signal;

use clap::{Parser, Subcommand};

use skiff_core::cancel::CancelFlag;

#[derive(Parser)]
#[command(
    name = "skiff",
    version,
    about = "Deduplicated incremental backups",
    after_help = "\
Environment variables:
  SKIFF_SERVER_URL   Server URL (overrides the saved login)
  SKIFF_TOKEN        Auth token (overrides the saved login)"
)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to a backup server. The token is optional for download-only use.
    Login {
        /// Server URL, e.g. https://backup.example.com
        server_url: String,

        /// Authentication token for uploads
        #[arg(long)]
        token: Option<String>,
    },

    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Create a new backup of a directory
    Create {
        /// Tag in key=value form; the 'name' tag is required (repeatable)
        #[arg(long = "tag", value_name = "KEY=VALUE")]
        tags: Vec<String>,

        /// Number of concurrent upload workers
        #[arg(long, default_value_t = skiff_core::backup::DEFAULT_UPLOAD_WORKERS)]
        concurrency: usize,

        /// Extra gitignore-style exclude pattern (repeatable)
        #[arg(long = "exclude", value_name = "PATTERN")]
        excludes: Vec<String>,

        /// Directory to back up
        path: String,
    },

    /// List backups, optionally filtered by tags
    List {
        /// Filter tag in key=value form (repeatable)
        #[arg(long = "tag", value_name = "KEY=VALUE")]
        tags: Vec<String>,
    },

    /// Restore a backup into a directory
    Restore {
        /// Manifest ID to restore
        #[arg(long)]
        id: Option<String>,

        /// Restore the latest backup matching these tags (repeatable)
        #[arg(long = "tag", value_name = "KEY=VALUE")]
        tags: Vec<String>,

        /// Number of concurrent download workers
        #[arg(long, default_value_t = skiff_core::restore::DEFAULT_DOWNLOAD_WORKERS)]
        concurrency: usize,

        /// Destination directory
        output: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancelFlag::new();
    signal::install(cancel.clone());

    let result = match cli.command {
        Commands::Login { server_url, token } => cmd::login::run(&server_url, token.as_deref()),
        Commands::Backup { command } => match command {
            BackupCommand::Create {
                tags,
                concurrency,
                excludes,
                path,
            } => cmd::create::run(&tags, concurrency, &excludes, &path, &cancel),
            BackupCommand::List { tags } => cmd::list::run(&tags),
            BackupCommand::Restore {
                id,
                tags,
                concurrency,
                output,
            } => cmd::restore::run(id.as_deref(), &tags, concurrency, &output, &cancel),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
