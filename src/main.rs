//! Command-line front end for the shim gateway client.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shimclient::config::{
    ClientConfig, ConnectionConfig, ATTEMPTS_DEFAULT, ATTEMPTS_ENV_NAME, HOST_DEFAULT,
    HOST_ENV_NAME, INVALID_CERTS_ENV_NAME, PASSWORD_DEFAULT, PASSWORD_ENV_NAME, PORT_ENV_NAME,
    TIMEOUT_DEFAULT_SECS, TIMEOUT_ENV_NAME, USER_DEFAULT, USER_ENV_NAME,
};
use shimclient::{Rectangle, ShimClient};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "shimclient")]
#[command(about = "Inspect and move data through a shim array gateway")]
struct Args {
    /// Gateway host; an https:// scheme selects TLS
    #[arg(long, env = HOST_ENV_NAME, default_value = HOST_DEFAULT)]
    host: String,

    /// Gateway port (default: 8083 over TLS, 8080 otherwise)
    #[arg(long, env = PORT_ENV_NAME)]
    port: Option<u16>,

    #[arg(long, env = USER_ENV_NAME, default_value = USER_DEFAULT)]
    user: String,

    #[arg(long, env = PASSWORD_ENV_NAME, default_value = PASSWORD_DEFAULT, hide_env_values = true)]
    password: String,

    /// Attempts per request before a transient failure is reported
    #[arg(long, env = ATTEMPTS_ENV_NAME, default_value_t = ATTEMPTS_DEFAULT)]
    retries: u32,

    /// Per-request timeout in seconds
    #[arg(long, env = TIMEOUT_ENV_NAME, default_value_t = TIMEOUT_DEFAULT_SECS)]
    timeout: u64,

    /// Accept self-signed gateway certificates
    #[arg(long, env = INVALID_CERTS_ENV_NAME)]
    accept_invalid_certs: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the gateway version.
    Version,
    /// Print the resolved metadata of an array as JSON.
    Describe { array: String },
    /// Check whether an array exists.
    Exists { array: String },
    /// Print min, max, mean and stdev of one attribute.
    Stats {
        array: String,
        #[arg(long, default_value = "0")]
        attribute: usize,
    },
    /// Write the raw cells of one attribute over a rectangle to a file.
    Read {
        array: String,
        #[arg(long, default_value = "0")]
        attribute: usize,
        /// Horizontal range as low:high, inclusive
        #[arg(long)]
        x: String,
        /// Vertical range as low:high, inclusive
        #[arg(long)]
        y: String,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Remove an array.
    Remove { array: String },
    /// Store the contents of one array into another.
    Copy { source: String, destination: String },
}

/// Parse `low:high` into an inclusive range.
fn parse_range(value: &str) -> Result<(i64, i64)> {
    let (low, high) = value
        .split_once(':')
        .with_context(|| format!("range '{}' is not low:high", value))?;
    let (low, high) = (low.trim(), high.trim());
    Ok((
        low.parse().with_context(|| format!("bad range start '{}'", low))?,
        high.parse().with_context(|| format!("bad range end '{}'", high))?,
    ))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ClientConfig {
        attempts: args.retries,
        timeout: Duration::from_secs(args.timeout),
        accept_invalid_certs: args.accept_invalid_certs,
        ..ClientConfig::new(ConnectionConfig::new(
            &args.host,
            args.port,
            &args.user,
            &args.password,
        ))
    };
    info!(url = %config.connection.base_url(), "Connecting");
    let mut client = ShimClient::new(config)?;

    match args.command {
        Command::Version => println!("{}", client.test_connection()?),
        Command::Describe { array } => {
            let meta = client.describe(&array)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Exists { array } => println!("{}", client.array_exists(&array)?),
        Command::Stats { array, attribute } => {
            let meta = client.describe(&array)?;
            let stats = client.attribute_stats(&meta, attribute)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Read {
            array,
            attribute,
            x,
            y,
            output,
        } => {
            let (x_min, x_max) = parse_range(&x)?;
            let (y_min, y_max) = parse_range(&y)?;
            let rect = Rectangle::new(x_min, x_max, y_min, y_max);
            let meta = client.describe(&array)?;
            let width = meta
                .attribute(attribute)
                .with_context(|| format!("array '{}' has no attribute {}", array, attribute))?
                .cell_width();
            let len = meta
                .slab(&rect)
                .byte_len(width)
                .with_context(|| format!("rectangle {} needs more bytes than addressable", rect))?;
            let mut buf = vec![0u8; len];
            client.read(&meta, attribute, rect, &mut buf)?;
            fs::write(&output, &buf).with_context(|| format!("cannot write {}", output.display()))?;
            info!(bytes = buf.len(), path = %output.display(), "Wrote rectangle");
        }
        Command::Remove { array } => client.remove_array(&array)?,
        Command::Copy {
            source,
            destination,
        } => client.copy_array(&source, &destination)?,
    }
    Ok(())
}
