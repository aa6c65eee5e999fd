mod config;
mod retry;
mod session;
mod signals;
mod watchdog;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit code for unusable configuration (`EX_CONFIG` from sysexits.h).
const EXIT_CONFIG: i32 = 78;
/// Exit code when the command could not be started at all.
const EXIT_FATAL: i32 = 1;

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0        the command succeeded
  N        the command's own non-zero exit code (no retry applied)
  1        every attempt failed, or the command could not be started
  2        invalid command-line arguments
  78       invalid configuration file
  130/143  interrupted by SIGINT/SIGTERM (the running command is killed)";

/// Run a shell command, killing and retrying it whenever it prints no output
/// line within the timeout.
#[derive(Parser, Debug)]
#[command(name = "console-retry", version, about, after_help = EXIT_CODES_HELP)]
pub struct Cli {
    /// The ("quoted") command to monitor and retry
    #[arg(value_name = "COMMAND", required = true, num_args = 1..)]
    command: Vec<String>,

    /// Seconds to wait for the next output line (0 disables) [default: 60]
    #[arg(short = 't', value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Maximum number of attempts [default: 3]
    #[arg(short = 'r', value_name = "ATTEMPTS", value_parser = clap::value_parser!(u32).range(1..))]
    retries: Option<u32>,

    /// Double the timeout on every retry
    #[arg(short = 'p')]
    progressive: bool,

    /// Disable the timeout on the last attempt
    #[arg(short = 's')]
    skip_last: bool,

    /// Retry despite a non-zero exit if the output contains this string (repeatable)
    #[arg(short = 'o', value_name = "STRING")]
    retry_outputs: Vec<String>,

    /// Config file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (deadline resets, stream events)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(cli: Cli) -> i32 {
    let (config_path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(config::DEFAULT_CONFIG_FILE), false),
    };

    let mut cfg = match config::load(&config_path, required) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{e}");
            return EXIT_CONFIG;
        }
    };
    cfg.apply(config::Overrides {
        timeout_secs: cli.timeout,
        max_attempts: cli.retries,
        progressive: cli.progressive,
        skip_timeout_on_last_attempt: cli.skip_last,
        retry_outputs: cli.retry_outputs,
    });
    if let Err(e) = cfg.validate() {
        tracing::error!("{e}");
        return EXIT_CONFIG;
    }

    let command = config::normalize_command(&cli.command);
    let policy = cfg.retry_policy();

    if cli.dry_run {
        println!("console-retry v{}", env!("CARGO_PKG_VERSION"));
        println!("Command:      {command}");
        println!("Shell:        {}", cfg.shell);
        println!("Timeout:      {}", retry::describe_timeout(policy.timeout));
        println!("Attempts:     {}", policy.max_attempts);
        println!("Progressive:  {}", policy.progressive);
        println!("Skip last:    {}", policy.skip_timeout_on_last_attempt);
        println!("Retry on:     {:?}", policy.retry_outputs);
        println!("Dry run mode, not running.");
        return 0;
    }

    let group = signals::ActiveGroup::default();
    let runner = session::ShellRunner::new(cfg.shell, group.clone());
    let mut controller = retry::RetryController::new(policy, runner);
    tokio::select! {
        // Listed first so the handlers are installed before the first spawn.
        biased;
        shutdown = signals::shutdown_signal() => {
            let pgid = group.kill();
            tracing::warn!(?shutdown, pgid = ?pgid, "received shutdown signal, killed running command");
            shutdown.exit_code()
        }
        result = controller.execute(&command) => match result {
            Ok(verdict) => {
                tracing::info!(%verdict, "run complete");
                verdict.exit_code()
            }
            Err(e) => {
                tracing::error!("{e}");
                EXIT_FATAL
            }
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = run(cli).await;
    std::process::exit(code);
}
