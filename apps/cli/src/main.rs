use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use omdfu_core::{FwState, ImageHeader, ImageState, UpgraderConfig};
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Optical module firmware image tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the header and state section of a firmware binary
    Info {
        /// Firmware binary
        file: PathBuf,
    },

    /// Prepend a header to a raw firmware binary, in place
    Create {
        /// Raw binary without a header
        file: PathBuf,

        /// Firmware identifier (a, b, crs, taurus_osfp, taurus_qdd, taurus1)
        #[arg(long)]
        id: String,

        /// Target device (stm32, taurus, taurus1)
        #[arg(long)]
        target: String,
    },

    /// Update header fields of an existing firmware binary
    Update {
        /// Firmware binary
        file: PathBuf,

        /// New firmware identifier
        #[arg(long)]
        id: Option<String>,

        /// New target device
        #[arg(long)]
        target: Option<String>,

        #[arg(long)]
        major: Option<u8>,

        #[arg(long)]
        minor: Option<u8>,

        #[arg(long)]
        build: Option<u16>,

        /// Write the updated header to this file instead of in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show or update the in-flash image state section
    State {
        /// Firmware binary
        file: PathBuf,

        /// Reset the section to a single entry with this state
        /// (default, writing, verified, aborted, deprecated,
        /// committed, erased)
        #[arg(long)]
        set: Option<String>,

        /// Write the section to this file instead of in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the default upgrader configuration as TOML
    Config {
        /// Output file
        file: PathBuf,
    },
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Info { file } => {
            let header =
                ImageHeader::load(&file).with_context(|| format!("reading {}", file.display()))?;
            println!("{header}");
            let computed = header.compute_image_crc();
            if computed == header.image_crc {
                println!("  image CRC:      OK");
            } else {
                println!("  image CRC:      MISMATCH (computed 0x{computed:08x})");
            }
            let state = ImageState::load(&file)?;
            println!("{state}");
        }
        Command::Create { file, id, target } => {
            let header = ImageHeader::create(&file, &id, &target)
                .with_context(|| format!("writing header to {}", file.display()))?;
            println!("{header}");
        }
        Command::Update {
            file,
            id,
            target,
            major,
            minor,
            build,
            output,
        } => {
            let mut header =
                ImageHeader::load(&file).with_context(|| format!("reading {}", file.display()))?;
            header.update(id.as_deref(), target.as_deref())?;
            if major.is_some() || minor.is_some() || build.is_some() {
                header.set_version(major, minor, build);
            }
            header.write(output.as_deref())?;
            println!("{header}");
        }
        Command::State { file, set, output } => {
            let mut state =
                ImageState::load(&file).with_context(|| format!("reading {}", file.display()))?;
            if let Some(name) = set {
                let Some(value) = FwState::from_name(&name) else {
                    bail!("unexpected state: '{name}'");
                };
                state.update(value);
                state.write(output.as_deref())?;
            }
            println!("{state}");
        }
        Command::Config { file } => {
            UpgraderConfig::default()
                .save_to_file(&file)
                .with_context(|| format!("writing {}", file.display()))?;
            println!("wrote defaults to {}", file.display());
        }
    }
    Ok(())
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

    if let Err(e) = run(args.command) {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
