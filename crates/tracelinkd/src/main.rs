use anyhow::Result;
use tracelinkd::cli::parse_cli;
use tracelinkd::{init_logging, run};

fn main() -> Result<()> {
    let cli = parse_cli();
    init_logging(cli.log_format)?;
    run(cli)
}
