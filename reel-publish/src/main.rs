//! reel-publish - Publish content to connected video platforms
//!
//! Wires configuration, logging, the SQLite store and the credential key into
//! a [`PublishEngine`] so the engine can be driven from a shell.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use libreelcast::config::{expand_path, resolve_config_path};
use libreelcast::credentials::TokenCipher;
use libreelcast::logging::LoggingConfig;
use libreelcast::{
    Config, ContentRef, Credential, PlatformId, PublishEngine, PublishStats, ReelcastError,
    Result, StatsQuery, TaskStatus, TaskView,
};

#[derive(Parser, Debug)]
#[command(name = "reel-publish")]
#[command(version)]
#[command(about = "Publish content to connected video platforms")]
#[command(long_about = "\
reel-publish - Publish content to connected video platforms

DESCRIPTION:
    reel-publish submits one piece of content to several platforms on behalf
    of a connected account. Each platform is published to independently and
    retried on transient failures; the task ends as success, partial_success
    or failed.

    Tokens are stored encrypted with the credential key and refreshed before
    they expire.

USAGE:
    # Create the credential key (once)
    reel-publish keygen

    # Store tokens obtained from the platform's OAuth flow
    reel-publish connect --account me --platform youtube \\
        --access-token ya29... --refresh-token 1//... --expires-in 3599

    # Publish and wait for the outcome
    reel-publish publish --account me --platform youtube \\
        --title \"Launch day\" --wait https://cdn.example/launch.mp4

CONFIGURATION:
    Configuration file: ~/.config/reelcast/config.toml (or REELCAST_CONFIG)
    Credential key:     ~/.config/reelcast/credential.key (or REELCAST_CREDENTIAL_KEY)

EXIT CODES:
    0 - Success
    1 - Runtime error, or the task did not fully succeed
    2 - Account must be connected again
    3 - Invalid input
")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "REELCAST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the credential key file
    Keygen {
        /// Where to write the key (defaults to credentials.key_file)
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Store OAuth tokens for an account
    Connect {
        #[arg(long)]
        account: String,

        #[arg(long)]
        platform: PlatformId,

        #[arg(long, env = "REELCAST_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,

        #[arg(long, env = "REELCAST_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: String,

        /// Seconds until the access token expires
        #[arg(long, default_value_t = 3600)]
        expires_in: i64,

        /// Granted OAuth scope (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },

    /// Remove the stored tokens for an account
    Disconnect {
        #[arg(long)]
        account: String,

        #[arg(long)]
        platform: PlatformId,
    },

    /// Publish content to one or more platforms
    Publish {
        /// Media URI (https://, file:// or a local path)
        uri: String,

        #[arg(long)]
        account: String,

        /// Target platform(s) (comma-separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        platform: Vec<PlatformId>,

        #[arg(long)]
        title: String,

        #[arg(long)]
        description: Option<String>,

        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Print the final task instead of only its id
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 600, value_name = "SECONDS")]
        timeout: u64,
    },

    /// Show a task and its per-platform records
    Status { task_id: String },

    /// Cancel a task
    Cancel { task_id: String },

    /// Show publishing stats
    Stats {
        #[arg(long)]
        account: Option<String>,

        /// Only tasks created at or after this Unix timestamp
        #[arg(long)]
        since: Option<i64>,

        /// Only tasks created before this Unix timestamp
        #[arg(long)]
        until: Option<i64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    if std::env::var("REELCAST_LOG_LEVEL").is_err() {
        logging.level = "warn".to_string();
    }
    logging.verbose = cli.verbose;
    if let Err(e) = logging.try_init() {
        eprintln!("Warning: {}", e);
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => expand_path(&path.to_string_lossy()),
        None => resolve_config_path()?,
    };

    if path.exists() {
        tracing::debug!("Loading configuration from {}", path.display());
        Config::load_from_path(&path)
    } else {
        tracing::debug!("No configuration at {}, using defaults", path.display());
        Ok(Config::default_config())
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(cli.config.as_ref())?;
    let format = cli.format;

    if let Command::Keygen { output } = &cli.command {
        let path = match output {
            Some(path) => path.clone(),
            None => expand_path(&config.credentials.key_file),
        };
        let cipher = TokenCipher::write_new_key_file(&path)?;
        match format {
            OutputFormat::Text => {
                println!("Wrote credential key to {}", path.display());
                println!("Public key: {}", cipher.recipient());
            }
            OutputFormat::Json => print_json(&serde_json::json!({
                "key_file": path,
                "public_key": cipher.recipient(),
            }))?,
        }
        return Ok(0);
    }

    let engine = PublishEngine::from_config(&config).await?;
    let result = execute(&engine, cli.command, format).await;
    engine.shutdown().await;
    result
}

async fn execute(engine: &PublishEngine, command: Command, format: OutputFormat) -> Result<i32> {
    match command {
        Command::Keygen { .. } => Ok(0),

        Command::Connect {
            account,
            platform,
            access_token,
            refresh_token,
            expires_in,
            scopes,
        } => {
            let expires_at = chrono::Utc::now().timestamp() + expires_in;
            let credential = Credential::new(
                account.clone(),
                platform,
                access_token,
                refresh_token,
                expires_at,
                scopes,
            );
            engine.connect_account(credential).await?;

            match format {
                OutputFormat::Text => println!("Connected {} on {}", account, platform),
                OutputFormat::Json => print_json(&serde_json::json!({
                    "account_id": account,
                    "platform": platform,
                    "expires_at": expires_at,
                }))?,
            }
            Ok(0)
        }

        Command::Disconnect { account, platform } => {
            engine.disconnect_account(&account, platform).await?;
            match format {
                OutputFormat::Text => println!("Disconnected {} on {}", account, platform),
                OutputFormat::Json => print_json(&serde_json::json!({
                    "account_id": account,
                    "platform": platform,
                }))?,
            }
            Ok(0)
        }

        Command::Publish {
            uri,
            account,
            platform,
            title,
            description,
            tags,
            wait,
            timeout,
        } => {
            let mut content = ContentRef::new(uri, title);
            content.description = description;
            content.tags = tags;

            let task_id = engine.submit_publish(&account, content, platform).await?;

            // Workers live in this process, so the task is always driven to
            // the end; --wait only changes what is printed
            if !wait {
                match format {
                    OutputFormat::Text => println!("{}", task_id),
                    OutputFormat::Json => {
                        print_json(&serde_json::json!({ "task_id": task_id }))?
                    }
                }
            }

            let view = engine
                .wait_for_terminal(&task_id, Duration::from_secs(timeout))
                .await?;

            if wait {
                print_view(&view, format)?;
            }

            for key in engine.accounts_needing_reauthorization() {
                eprintln!("Account {} must be connected again", key);
            }

            Ok(match view.task.status {
                TaskStatus::Success => 0,
                _ => 1,
            })
        }

        Command::Status { task_id } => {
            let view = engine.task_status(&task_id).await?;
            print_view(&view, format)?;
            Ok(0)
        }

        Command::Cancel { task_id } => {
            let cancelled = engine.cancel_task(&task_id).await?;
            match format {
                OutputFormat::Text if cancelled => println!("Cancelled {}", task_id),
                OutputFormat::Text => println!("{} already finished", task_id),
                OutputFormat::Json => print_json(&serde_json::json!({
                    "task_id": task_id,
                    "cancelled": cancelled,
                }))?,
            }
            Ok(if cancelled { 0 } else { 1 })
        }

        Command::Stats {
            account,
            since,
            until,
        } => {
            let query = StatsQuery {
                account_id: account,
                since,
                until,
            };
            let stats = engine.stats(&query).await?;
            print_stats(&stats, format)?;
            Ok(0)
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let output = serde_json::to_string_pretty(value)
        .map_err(|e| ReelcastError::InvalidInput(format!("Failed to format output: {}", e)))?;
    println!("{}", output);
    Ok(())
}

fn print_view(view: &TaskView, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(view);
    }

    println!("{}  {}  {}", view.task.id, view.task.status, view.task.content.title);
    for record in &view.records {
        let detail = record
            .external_id
            .as_deref()
            .or(record.last_error.as_deref())
            .unwrap_or("-");
        println!(
            "  {:<10} {:<9} attempts={} {}",
            record.platform.as_str(),
            record.status.as_str(),
            record.attempt_count,
            detail
        );
    }
    Ok(())
}

fn print_stats(stats: &PublishStats, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(stats);
    }

    let tasks = &stats.tasks;
    println!("Tasks:            {}", tasks.total());
    println!("  success:        {}", tasks.success);
    println!("  partial:        {}", tasks.partial_success);
    println!("  failed:         {}", tasks.failed);
    println!("  cancelled:      {}", tasks.cancelled);
    println!("  in progress:    {}", tasks.pending + tasks.in_progress);
    println!("Success rate:     {:.1}%", stats.success_rate * 100.0);
    println!("Attempts/success: {:.2}", stats.average_attempts_per_success);
    Ok(())
}
