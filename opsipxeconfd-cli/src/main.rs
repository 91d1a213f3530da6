mod cli;
mod client;
mod commands;
mod pidfile;

use clap::{CommandFactory, Parser};

use cli::{Cli, Command};
use opsipxeconfd::DaemonConfig;

fn main() {
    let cli = Cli::parse();

    if let Err(error) = run(cli) {
        eprintln!("ERROR: {:#}", error);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.version || matches!(cli.command, Some(Command::Version)) {
        println!("opsipxeconfd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some(command) = &cli.command else {
        Cli::command().print_help()?;
        std::process::exit(1);
    };

    let mut config = DaemonConfig::load(&cli.conffile)?;
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    match command {
        Command::Start => commands::start::execute(&cli, config),
        Command::Stop => commands::stop::execute(&config),
        Command::Status => commands::status::execute(&config),
        Command::Update {
            client_id,
            cache_path,
        } => commands::update::execute(&config, client_id, cache_path.as_deref()),
        Command::Version => unreachable!("handled above"),
    }
}
