// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::unpack;

/// Unpack partition images from an Android super image.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the super image or block device.
    pub image: PathBuf,

    /// Directory to write the partition images to.
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub output: PathBuf,

    /// Partition to unpack. Can be specified multiple times; all partitions
    /// are unpacked if none are specified.
    #[arg(short, long, value_name = "NAME")]
    pub partition: Vec<String>,

    /// Metadata slot number to read.
    #[arg(short = 'S', long, value_name = "SLOT", default_value_t = 0)]
    pub slot: u32,
}

fn init_logging(logging_initialized: &AtomicBool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    logging_initialized.store(true, Ordering::SeqCst);
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(logging_initialized);

    unpack::unpack_main(&cli, cancel_signal)
}
