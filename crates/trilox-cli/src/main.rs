//! Trilox CLI entry point

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trilox", version, about = "Three-valued-logic scripting language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run a Trilox source file
    Run {
        /// Path to a `.trx` source file
        file: String,
        /// Path to a `trilox.toml`-shaped VM config file
        #[arg(long)]
        config: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { file, config } => commands::run::run(&file, config.as_deref()),
    }
}
