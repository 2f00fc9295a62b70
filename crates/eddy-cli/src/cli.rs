use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "eddy",
    about = "Eddy: reactive in-process entity cache",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log store internals (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Store configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a blog lifecycle against an in-memory backend
    Demo(DemoArgs),
    /// Print the effective store configuration
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Number of posts to create
    #[arg(short = 'n', long, default_value_t = 3)]
    pub count: usize,

    /// Make the first save fail, then retry it
    #[arg(long)]
    pub fail_first_save: bool,
}
