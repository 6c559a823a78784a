use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use rollsync::cli::args::{Cli, Commands};
use rollsync::cli::commands::{self, Context};
use rollsync::logging;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}: {:#}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref())?;
    let format = cli.output;

    let context = || Context::load(cli.data_dir.clone(), cli.config.clone(), format);

    let output = match cli.command {
        Commands::Queue(args) => commands::queue(&context()?, args.command).await?,
        Commands::Sync(args) => commands::sync(&context()?, args.command).await?,
        Commands::Cache(args) => commands::cache(&context()?, args.command).await?,
        Commands::Completions { shell } => commands::completions(shell)?,
    };

    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
