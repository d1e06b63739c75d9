use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = karma_cli::Cli::parse();
    karma_cli::init_tracing(cli.log_level());
    karma_cli::run_cli(cli)
}
