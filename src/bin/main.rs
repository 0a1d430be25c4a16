use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use addond::server::{Server, run_server};
use addond::telemetry;

#[derive(Parser, Debug)]
#[command(name = "addond", version, about = "Add-on distribution server")]
struct Cli {
    /// Server configuration file
    #[arg(long, default_value = "server.cfg")]
    config: PathBuf,

    /// Server directory holding data/ (defaults to the current directory)
    #[arg(long)]
    server_dir: Option<PathBuf>,

    /// Listening port override; never written back to the config file
    #[arg(long)]
    port: Option<u16>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            // Bad CLI arguments have their own exit code in the contract.
            eprint!("{e}");
            return ExitCode::from(10);
        }
        Err(e) => {
            // --help / --version
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    telemetry::init(cli.verbose);

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("cannot determine the current directory: {e}");
            return ExitCode::from(1);
        }
    };

    // Paths given on the command line stay relative to the invocation
    // directory, even when --server-dir moves the server root.
    let root = match &cli.server_dir {
        Some(dir) => cwd.join(dir),
        None => cwd.clone(),
    };
    if !root.is_dir() {
        eprintln!("server directory '{}' does not exist or is not a directory", root.display());
        return ExitCode::from(1);
    }

    let config = if cli.config.is_absolute() {
        cli.config.clone()
    } else {
        cwd.join(&cli.config)
    };
    if config.is_dir() {
        eprintln!("server configuration file '{}' is not a file", config.display());
        return ExitCode::from(1);
    }

    tracing::info!("addond v{} starting", env!("CARGO_PKG_VERSION"));

    let server = match Server::new(root, &config, cli.port) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    match run_server(server) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
