mod config;
mod lifecycle;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cvmboot_core::{DeviceMapper, MountedEsp};
use cvmboot_platform::DmsetupDeviceMapper;
use cvmboot_sign::ExternalSignTool;

#[derive(Parser)]
#[command(name = "cvmboot")]
#[command(about = "Confidential-VM disk image toolchain: thin-provisioned, dm-verity-protected boot images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy an input image, add thin-provisioning and verity partitions
    Prepare {
        input: PathBuf,
        output: PathBuf,
        /// Mounted ESP directory to record the root hash into
        #[arg(long)]
        esp: Option<PathBuf>,
    },
    /// Sign the ESP's cvmboot home directory
    Protect {
        disk: PathBuf,
        esp: PathBuf,
        /// Path to an external signtool binary
        #[arg(long)]
        signtool: PathBuf,
    },
    /// Run prepare then protect against the same disk
    Init {
        input: PathBuf,
        output: PathBuf,
        esp: PathBuf,
        #[arg(long)]
        signtool: PathBuf,
    },
    /// Check the projected root against its recorded verity root hash
    Verify { disk: PathBuf },
    /// Drop the root partition and its thin/verity companions, keeping the rest
    Strip { disk: PathBuf },
    /// Print the disk image's lifecycle state
    State { disk: PathBuf, esp: PathBuf },
    /// Generate a signing keypair under ~/.cvmsign
    Genkeys,
}

fn device_mapper() -> Arc<dyn DeviceMapper> {
    Arc::new(DmsetupDeviceMapper)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Prepare { input, output, esp } => {
            let report = lifecycle::prepare(&input, &output, device_mapper(), esp.as_deref())?;
            println!("root hash: {}", report.roothash);
            println!("verity uuid: {}", report.verity_uuid);
        }
        Commands::Protect { disk, esp, signtool } => {
            let tool = ExternalSignTool::new(signtool);
            let report = lifecycle::protect(&disk, &esp, &tool)?;
            println!("signer: {}", report.signer_hash);
        }
        Commands::Init {
            input,
            output,
            esp,
            signtool,
        } => {
            let tool = ExternalSignTool::new(signtool);
            let (prepare_report, protect_report) = lifecycle::init(&input, &output, device_mapper(), &esp, &tool)?;
            println!("root hash: {}", prepare_report.roothash);
            println!("signer: {}", protect_report.signer_hash);
        }
        Commands::Verify { disk } => {
            lifecycle::verify(&disk, device_mapper())?;
            println!("verified");
        }
        Commands::Strip { disk } => {
            lifecycle::strip(&disk)?;
            println!("stripped");
        }
        Commands::State { disk, esp } => {
            let probe = MountedEsp::new(&esp);
            let state = lifecycle::state(&disk, &probe)?;
            println!("{state}");
        }
        Commands::Genkeys => {
            let paths = cvmboot_sign::generate_keys()?;
            println!("private key: {}", paths.private_key.display());
            println!("public key: {}", paths.public_key.display());
        }
    }

    Ok(())
}
