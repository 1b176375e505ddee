use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "carapace", about = "Ephemeral VM pool for sandboxed agent commands")]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the warm pool and control server until interrupted
    Serve {
        /// Base qcow2 image (defaults to $CARAPACE_IMAGE, then $IMAGE_PATH)
        #[arg(long)]
        image: Option<PathBuf>,

        /// Address for the control server (loopback only by design)
        #[arg(long, default_value = "127.0.0.1:9670")]
        bind: SocketAddr,

        /// Number of warm VMs to keep ready
        #[arg(long, default_value_t = 2)]
        pool_size: usize,

        /// Hard cap on concurrent VMs
        #[arg(long, default_value_t = 4)]
        max_size: usize,

        /// Guest RAM in MiB
        #[arg(long, default_value_t = 512)]
        memory_mb: u32,
    },

    /// Boot a fresh VM, run one command, destroy the VM
    Run {
        /// Base qcow2 image (defaults to $CARAPACE_IMAGE, then $IMAGE_PATH)
        #[arg(long)]
        image: Option<PathBuf>,

        /// Shell command to execute in the guest
        command: String,
    },

    /// Build a first-boot seed ISO standalone (for debugging)
    Seed {
        /// Path to an OpenSSH public key file to authorise
        #[arg(long)]
        key: PathBuf,

        /// Output ISO path
        #[arg(long, default_value = "seed.iso")]
        out: PathBuf,

        /// Guest hostname
        #[arg(long)]
        hostname: Option<String>,
    },
}
