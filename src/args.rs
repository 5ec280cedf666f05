use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vwd")]
#[command(version)]
#[command(about = "Supervise a pool of prediction engine workers", long_about = None)]
pub(crate) struct Cli {
    /// Config file (default: $VWD_CONFIG_DIR/config.toml or ~/.config/vwd/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start the engine and answer prediction requests read from stdin
    Run(RunArgs),

    /// Report how many engine processes are live on a port
    Status {
        /// Port to inspect (default: configured port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Kill every engine process bound to a port
    Stop {
        /// Port to stop (default: configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Args, Debug, Default)]
pub(crate) struct RunArgs {
    /// Engine binary (default: vw)
    #[arg(long)]
    pub binary: Option<PathBuf>,

    /// Port of the first instance (default: 26542)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Worker children; pool capacity is half of this
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Model artifact to load
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Run the engine in test-only mode
    #[arg(long)]
    pub test: bool,

    /// Forward engine stdout/stderr to the log
    #[arg(long)]
    pub verbose_engine: bool,

    /// Do not hot-reload when the model file changes
    #[arg(long)]
    pub no_watch: bool,

    /// Print each prediction as a JSON object
    #[arg(long)]
    pub json: bool,
}

impl From<RunArgs> for vwd::config::Overrides {
    fn from(args: RunArgs) -> Self {
        Self {
            binary: args.binary,
            port: args.port,
            workers: args.workers,
            model: args.model,
            test: args.test,
            verbose_engine: args.verbose_engine,
            no_watch: args.no_watch,
        }
    }
}
