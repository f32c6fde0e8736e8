use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = nav_tree_cli::Cli::parse();
    nav_tree_cli::run_cli(cli)
}
