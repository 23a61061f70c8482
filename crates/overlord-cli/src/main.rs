use clap::{CommandFactory, Parser, Subcommand};
use overlord_core::Config;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "overlord", version, about = "Departure alarm planner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Alarm profile management
    Profile {
        #[command(subcommand)]
        action: commands::profile::ProfileAction,
    },
    /// Alarm template editing within a profile
    Template {
        #[command(subcommand)]
        action: commands::template::TemplateAction,
    },
    /// Journey scheduling
    Journey {
        #[command(subcommand)]
        action: commands::journey::JourneyAction,
    },
    /// Individual alarm control
    Alarm {
        #[command(subcommand)]
        action: commands::alarm::AlarmAction,
    },
    /// Re-arm every pending alarm (after boot or a clock change)
    Recover(commands::recover::RecoverArgs),
    /// Run the alarm daemon in the foreground
    Run,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Print shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(Config::load_or_default().logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "overlord", &mut std::io::stdout());
        return;
    }

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    let handle = runtime.handle();

    let result = match cli.command {
        Commands::Profile { action } => commands::profile::run(handle, action),
        Commands::Template { action } => commands::template::run(handle, action),
        Commands::Journey { action } => commands::journey::run(handle, action),
        Commands::Alarm { action } => commands::alarm::run(handle, action),
        Commands::Recover(args) => commands::recover::run(handle, args),
        Commands::Run => runtime.block_on(commands::run::run()),
        Commands::Config { action } => commands::config::run(action),
        Commands::Completions { .. } => Ok(()),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
