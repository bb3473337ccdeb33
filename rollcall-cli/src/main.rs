//! Rollcall CLI - QR + face classroom attendance client.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod camera;
mod commands;
mod exit_codes;
mod utils;

use exit_codes::ExitCode;

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0   Success
  1   General error
  64  Usage error (missing token, invalid arguments)
  65  Rejected (token refused, face not matched)
  66  Cannot read input (face image)
  69  Backend unavailable (network, server error without message)
  74  Cannot write output file";

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(author, version, about = "QR + face classroom attendance client", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Backend origin (overrides ROLLCALL_BASE_URL)
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    /// Session cookies as `name=value; ...` (overrides ROLLCALL_COOKIE)
    #[arg(long, global = true, value_name = "COOKIES")]
    cookie: Option<String>,

    /// Suppress user-facing output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an attendance session and display its rotating token
    Start {
        /// Classroom to take attendance for
        #[arg(short, long)]
        classroom: u64,

        /// Keep the session open this many seconds, then stop it
        #[arg(short, long, default_value_t = 60)]
        duration: u64,

        /// Use the in-memory mock backend (for testing)
        #[arg(long)]
        mock: bool,
    },

    /// Download a classroom's attendance spreadsheet
    Export {
        /// Classroom to export
        #[arg(short, long)]
        classroom: u64,

        /// File name without extension (defaults to attendance_<classroom>)
        #[arg(short, long)]
        name: Option<String>,

        /// Directory to write the spreadsheet into
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        out: PathBuf,

        /// Use the in-memory mock backend (for testing)
        #[arg(long)]
        mock: bool,
    },

    /// Register the reference face used for attendance checks
    Register {
        /// Image file holding the face to register
        #[arg(short, long, value_name = "IMAGE")]
        face: PathBuf,

        /// Use the in-memory mock backend (for testing)
        #[arg(long)]
        mock: bool,
    },

    /// Check in to a session with its token and a face capture
    Attend {
        /// Classroom the token belongs to
        #[arg(short, long)]
        classroom: u64,

        /// Token shown on the teacher's display (the mock backend opens a
        /// session and uses its token when omitted)
        #[arg(short, long)]
        token: Option<String>,

        /// Image file holding the face to verify
        #[arg(short, long, value_name = "IMAGE")]
        face: PathBuf,

        /// Use the in-memory mock backend (for testing)
        #[arg(long)]
        mock: bool,

        /// Similarity score the mock backend reports
        #[arg(long, value_name = "SCORE", requires = "mock")]
        mock_score: Option<f64>,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let backend = utils::BackendOptions {
        base_url: cli.base_url,
        cookie: cli.cookie,
        quiet: cli.quiet,
    };

    let result = match cli.command {
        Commands::Start {
            classroom,
            duration,
            mock,
        } => commands::start::execute(&backend, classroom, duration, mock).await,
        Commands::Export {
            classroom,
            name,
            out,
            mock,
        } => commands::export::execute(&backend, classroom, name, out, mock).await,
        Commands::Register { face, mock } => {
            commands::register::execute(&backend, face, mock).await
        }
        Commands::Attend {
            classroom,
            token,
            face,
            mock,
            mock_score,
        } => {
            commands::attend::execute(&backend, classroom, token, face, mock, mock_score).await
        }
    };

    if let Err(err) = result {
        let exit = ExitCode::from_anyhow(&err);
        if let Some(message) = &exit.message {
            eprintln!("{} {}", "Error:".red().bold(), message);
        }
        std::process::exit(exit.code);
    }
}
