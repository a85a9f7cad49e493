use anyhow::{Context, Result};
use clap::Parser;
use ikey_core::session::{DiagnosticsPolicy, IkSession, SessionConfig};
use ikey_core::transport::NusbBus;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "IntelliKeys USB bring-up tool", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Path to the loader image (binary records or Intel HEX)
    #[arg(long)]
    loader: Option<String>,

    /// Path to the main firmware image (binary records or Intel HEX)
    #[arg(long)]
    firmware: Option<String>,

    /// Descriptor read failure handling: strict, best-effort or skip
    #[arg(long)]
    diagnostics: Option<DiagnosticsPolicy>,

    /// Exit once the device has been initialized
    #[arg(long)]
    once: bool,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    write_config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Reading config {}", path))?,
        None => SessionConfig::default(),
    };
    if let Some(loader) = &args.loader {
        config.loader_path = Some(loader.clone());
    }
    if let Some(firmware) = &args.firmware {
        config.firmware_path = Some(firmware.clone());
    }
    if let Some(policy) = args.diagnostics {
        config.diagnostics = policy;
    }
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = build_config(args)?;

    if let Some(path) = &args.write_config {
        config.save_to_file(path)?;
        info!(path = %path, "Configuration written");
        return Ok(());
    }

    let images = config.load_images()?;
    for image in [&images.loader, &images.firmware] {
        info!(image = %image.name(), bytes = image.payload_len(), "Image loaded");
    }

    let bus = NusbBus::new(config.control_timeout());
    let mut session = IkSession::new(config, bus, images);

    if args.once {
        let version = session.run_until_ready()?;
        info!(version = %version, "Device initialized");
        Ok(())
    } else {
        session.run()
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting IntelliKeys tool (nusb backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
