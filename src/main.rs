use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use aoa_mirror_host::auth::Authenticator;
use aoa_mirror_host::decoder::NullDecoder;
use aoa_mirror_host::pipeline::Pipeline;
use aoa_mirror_host::renderer::LoggingRenderer;
use aoa_mirror_host::usb::{AccessoryIdentity, Transport};
use aoa_mirror_host::util::config;
use aoa_mirror_host::util::logging::{init_logger, LogVerbosity};

#[derive(Debug, Parser)]
#[command(name = "aoa-mirror-host", version, about = "Host-side AOA 2.0 screen mirror driver")]
struct Cli {
    /// Verbose logging (-v debug, -vv trace)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Manufacturer identification string sent during accessory negotiation
    #[arg(long, global = true)]
    manufacturer: Option<String>,

    /// Model identification string sent during accessory negotiation
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run only the AOA discovery/handshake state machine and print the
    /// negotiated endpoint addresses, without starting the pipeline.
    Probe,
    /// Load the signing key, connect, and stream until the pipeline stops or
    /// a fatal error.
    Run {
        /// Path to a PEM-encoded Ed25519 `PRIVATE KEY`
        #[arg(long)]
        key: Option<PathBuf>,
    },
    /// Persist the path to the Ed25519 key file (not the key itself).
    SetKey { path: PathBuf },
    /// Print the persisted non-secret configuration.
    ShowConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(match cli.verbose {
        0 => LogVerbosity::Normal,
        1 => LogVerbosity::Verbose,
        _ => LogVerbosity::Debug,
    });

    let mut state = config::load_state();

    let identity = {
        let mut identity = AccessoryIdentity::default();
        if let Some(m) = cli.manufacturer.clone().or_else(|| state.manufacturer.clone()) {
            identity.manufacturer = m;
        }
        if let Some(m) = cli.model.clone().or_else(|| state.model.clone()) {
            identity.model = m;
        }
        identity
    };

    match cli.command {
        Commands::Probe => {
            let mut transport = Transport::connect(&identity).context("connecting to AOA accessory")?;
            println!("AOA accessory connected");
            transport.disconnect();
        }
        Commands::Run { key } => {
            let key_path = key
                .or_else(|| state.key_path.clone().map(PathBuf::from))
                .context("no key path given; pass --key or run `set-key` first")?;
            let pem = fs::read_to_string(&key_path)
                .with_context(|| format!("reading key file {}", key_path.display()))?;
            let authenticator = Authenticator::load_from_pem(&pem)
                .map_err(|e| anyhow::anyhow!("loading Ed25519 key: {}", e))?;

            state.key_path = Some(key_path.display().to_string());
            let _ = config::save_state(&state);

            let mut pipeline = Pipeline::default();
            pipeline
                .start(
                    identity,
                    authenticator,
                    Box::new(NullDecoder::default()),
                    Box::new(LoggingRenderer::default()),
                    Some(Box::new(|msg: &str| println!("[status] {}", msg))),
                    None,
                )
                .context("starting pipeline")?;

            // No dedicated signal crate in the stack: SIGINT falls through to
            // the process default, which is acceptable since workers are
            // plain threads with nothing left to flush on exit. This loop
            // exits cooperatively on a fatal transport/auth failure.
            while pipeline.is_running() {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            pipeline.stop();
        }
        Commands::SetKey { path } => {
            if !path.exists() {
                bail!("key file not found: {}", path.display());
            }
            state.key_path = Some(path.display().to_string());
            config::save_state(&state).context("saving config")?;
            println!("key path saved: {}", path.display());
        }
        Commands::ShowConfig => {
            println!("key_path: {}", state.key_path.as_deref().unwrap_or("(none)"));
            println!("last_serial: {}", state.last_serial.as_deref().unwrap_or("(none)"));
            println!("manufacturer: {}", state.manufacturer.as_deref().unwrap_or("(default)"));
            println!("model: {}", state.model.as_deref().unwrap_or("(default)"));
        }
    }

    Ok(())
}
