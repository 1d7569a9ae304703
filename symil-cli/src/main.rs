//! symil CLI: symbolically execute and disassemble assembly files.
//!
//! Exit codes:
//! - 0: Success
//! - 1: Input, usage or assembly error
//! - 3: Engine error

mod commands;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "symil", version, about = "Symbolic interpreter for stack-machine assembly")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a method over concrete and symbolic arguments
    Run(commands::RunArgs),
    /// Print the canonical text of an assembly file
    Disasm {
        file: PathBuf,
        /// Only print the body of this method (`Type::Name`)
        #[arg(long)]
        method: Option<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };
    init_logging();

    let result = match cli.command {
        Command::Run(args) => commands::run(&args),
        Command::Disasm { file, method } => commands::disasm(&file, method.as_deref()),
    };

    if let Err(code) = result {
        process::exit(code);
    }
}
