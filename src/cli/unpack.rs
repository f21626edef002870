// SPDX-License-Identifier: Apache-2.0

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::{
    cli::args::Cli,
    format::lp::{self, ImageExtractor},
    util,
};

pub fn unpack_main(cli: &Cli, cancel_signal: &AtomicBool) -> Result<()> {
    let file = File::open(&cli.image)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.image))?;
    let mut reader = BufReader::new(file);

    let metadata = lp::read_metadata_from(&mut reader, cli.slot)
        .with_context(|| format!("Failed to read metadata for slot {}", cli.slot))?;

    info!(
        "Metadata {}.{}: {} partitions, {} extents, {} groups, {} block devices",
        metadata.header.major_version,
        metadata.header.minor_version,
        metadata.partitions.len(),
        metadata.extents.len(),
        metadata.groups.len(),
        metadata.block_devices.len(),
    );

    for partition in &metadata.partitions {
        let size = metadata.partition_size(partition)?;

        info!(
            "Partition {:?}: {} extents, {size} bytes",
            partition.name, partition.num_extents,
        );
    }

    let names = if cli.partition.is_empty() {
        metadata.partitions.iter().map(|p| p.name.clone()).collect()
    } else {
        let missing = cli
            .partition
            .iter()
            .filter(|n| metadata.partition(n).is_none())
            .map(|n| n.as_str())
            .collect::<Vec<_>>();

        if !missing.is_empty() {
            bail!("Partitions not found: {}", missing.join(", "));
        }

        cli.partition.clone()
    };

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output))?;

    let mut extractor = ImageExtractor::new(&mut reader, &metadata);

    for name in &names {
        let path = util::path_join_single(&cli.output, &format!("{name}.img"))
            .with_context(|| format!("Invalid output filename for partition: {name:?}"))?;

        let raw_writer =
            File::create(&path).with_context(|| format!("Failed to open for writing: {path:?}"))?;
        let mut writer = BufWriter::new(raw_writer);

        let size = extractor
            .extract_partition(name, &mut writer, cancel_signal)
            .with_context(|| format!("Failed to extract partition: {name:?}"))?;

        writer
            .flush()
            .with_context(|| format!("Failed to flush: {path:?}"))?;

        info!("Unpacked {name:?} ({size} bytes) to {path:?}");
    }

    Ok(())
}
