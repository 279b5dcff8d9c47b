use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use rmx::client::{self, ClientOptions, bringup::CommandStart};
use rmx::config::Config;
use rmx::error::Result;
use rmx::ipc;
use rmx::ipc::message::ClientFlags;

#[derive(Parser)]
#[command(name = "rmx", version, about = "Client for the rmx terminal multiplexer")]
struct Cli {
    /// Run a shell command through the server instead of attaching
    #[arg(short = 'c', value_name = "SHELL-COMMAND")]
    shell_command: Option<String>,

    /// Control mode; twice (-CC) also takes over the terminal
    #[arg(short = 'C', action = ArgAction::Count)]
    control: u8,

    /// Treat the exec handoff shell as a login shell
    #[arg(short = 'l')]
    login: bool,

    /// Socket name under the per-user directory
    #[arg(short = 'L', value_name = "SOCKET-NAME")]
    socket_name: Option<String>,

    /// Full path to the server socket (overrides -L)
    #[arg(short = 'S', value_name = "SOCKET-PATH")]
    socket_path: Option<PathBuf>,

    /// Write a debug log to rmx-client-<pid>.log
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Multiplexer command, multiple commands separated by ";"
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn init_logging(verbose: u8) {
    if verbose == 0 {
        return;
    }
    let path = format!("rmx-client-{}.log", std::process::id());
    let Ok(file) = std::fs::File::create(path) else {
        return;
    };
    let filter = if verbose > 1 { "trace" } else { "debug" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init();
}

fn socket_path(cli: &Cli, config: &Config) -> Result<PathBuf> {
    if let Some(path) = &cli.socket_path {
        return Ok(path.clone());
    }
    ipc::ensure_socket_dir()?;
    let name = cli.socket_name.as_deref().unwrap_or(&config.socket_name);
    Ok(ipc::socket_path(name))
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config::load()?;
    let socket_path = socket_path(&cli, &config)?;

    let mut flags = ClientFlags::empty();
    if cli.login {
        flags.insert(ClientFlags::LOGIN);
    }
    if cli.control >= 1 {
        flags.insert(ClientFlags::CONTROL);
    }
    if cli.control >= 2 {
        flags.insert(ClientFlags::CONTROL_CONTROL);
    }

    let opts = ClientOptions {
        socket_path,
        flags,
        shell_command: cli.shell_command.clone(),
        command: cli.command.clone(),
    };
    let starter = CommandStart {
        command: config.server_command.clone(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(client::run(opts, &starter))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
