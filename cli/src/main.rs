use clap::{Parser, Subcommand};

mod commands;
mod util;

#[derive(Parser)]
#[command(
    name = "spotter",
    version,
    about = "Spotter CLI: recover AI-generated workout plans and schedule them onto a client's week"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Workout plan recovery and scheduling
    Plan {
        #[command(subcommand)]
        command: commands::plan::PlanCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    util::init_tracing();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Plan { command } => commands::plan::run(command).await,
    };
    std::process::exit(code);
}
