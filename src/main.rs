use std::io;
use std::sync::Arc;

use anyhow::Result;
use clap::CommandFactory;
use hostprov::cli::{self, Cli, Commands};
use hostprov::executor::{CommandExecutor, RealCommandExecutor};

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    if let Commands::Completions(opts) = &args.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(opts.shell, &mut cmd, name, &mut io::stdout());
        return Ok(());
    }

    hostprov::init_logging(args.command.log_level())?;

    match &args.command {
        Commands::Provision(opts) => {
            let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor {
                dry_run: opts.dry_run,
            });
            hostprov::run_provision(opts, executor)
        }
        Commands::Detect(opts) => {
            let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor {
                dry_run: false,
            });
            hostprov::run_detect(opts, executor)
        }
        Commands::Validate(opts) => hostprov::run_validate(opts),
        Commands::Download(opts) => hostprov::run_download(opts),
        Commands::Completions(_) => Ok(()),
    }
}
