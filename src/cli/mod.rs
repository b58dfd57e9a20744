use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::App;
use crate::config::{ConfigLoader, ConfigPaths};
use crate::store;

pub mod commands;

use self::commands::{
    CommandContext, DeleteArgs, EditArgs, ExportArgs, JoinArgs, ListArgs, ReadArgs, SendArgs,
    StarArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "letters",
    version,
    about = "Send and schedule letters to the members of a small group"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over LETTERS_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over LETTERS_DATA)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch the interactive TUI (default)
    Tui,
    /// Join a group under a display name
    Join(JoinArgs),
    /// Forget the current group membership
    Leave,
    /// Show the current group and name
    Whoami,
    /// Send a letter now or schedule it with --at
    Send(SendArgs),
    /// List delivered letters addressed to you
    Inbox(ListArgs),
    /// List letters you sent with their delivery status
    Sent(ListArgs),
    /// List everyone seen in the group
    Recipients,
    /// Mark inbox letters read
    Read(ReadArgs),
    /// Delete letters from your inbox (or your sent list with --sent)
    Delete(DeleteArgs),
    /// Toggle the star on an inbox letter
    Star(StarArgs),
    /// Change a letter that has not been delivered yet
    Edit(EditArgs),
    /// Write inbox letters to a paginated text document
    Export(ExportArgs),
}

/// Where log lines go. The TUI owns the terminal, so it logs to a file.
enum LogTarget<'a> {
    Stderr,
    File(&'a Path),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut paths = ConfigPaths::discover()?;
    if let Some(path) = cli.config.clone() {
        paths = paths.with_config_file(path);
    }
    if let Some(path) = cli.data_dir.clone() {
        paths = paths.with_data_dir(path);
    }
    let loader = ConfigLoader::with_paths(paths);
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();

    let command = cli.command.unwrap_or(Commands::Tui);
    let log_file = paths.log_dir.join("letters.log");
    let target = if matches!(command, Commands::Tui) {
        LogTarget::File(&log_file)
    } else {
        LogTarget::Stderr
    };
    init_tracing(&cli.log_level, target)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;

    let config = Arc::new(loader.load_or_init()?);
    let store = store::init(&paths, &config.storage)?;

    let mut ctx = CommandContext::new(config.clone(), store.clone(), &paths);
    let output = match command {
        Commands::Tui => {
            let mut app = App::new(config, store, &paths)?;
            return commands::run_tui(&mut app);
        }
        Commands::Join(args) => commands::join(&mut ctx, args),
        Commands::Leave => commands::leave(&mut ctx),
        Commands::Whoami => commands::whoami(&ctx),
        Commands::Send(args) => commands::send(&ctx, args),
        Commands::Inbox(args) => commands::inbox(&ctx, args),
        Commands::Sent(args) => commands::sent(&ctx, args),
        Commands::Recipients => commands::recipients(&ctx),
        Commands::Read(args) => commands::read(&ctx, args),
        Commands::Delete(args) => commands::delete(&ctx, args),
        Commands::Star(args) => commands::star(&ctx, args),
        Commands::Edit(args) => commands::edit(&ctx, args),
        Commands::Export(args) => commands::export(&ctx, args),
    }?;
    print!("{output}");
    Ok(())
}

fn init_tracing(level: &str, target: LogTarget<'_>) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        match target {
            LogTarget::Stderr => fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init(),
            LogTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                fmt()
                    .with_env_filter(env_filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .map(|_| ())
}
