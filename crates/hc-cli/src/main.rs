#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hc_block::{ByteDevice, FileByteDevice};
use hc_metadata::CacheMetadata;
use hc_policy::{is_policy_stack_string, policy_stack_create};
use hc_types::{DataBlockSize, DevId, BLOCK_DIRTY};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Fixed device id until multi-device tables arrive.
const DEV: DevId = DevId(1);

#[derive(Parser)]
#[command(name = "hcache", about = "hcache — block cache metadata toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create (format) cache metadata for a target:
    /// <cached_dev> <data_dev> <meta_dev> <data_block_size_sectors>.
    Create {
        /// Slow cached device holding original data blocks.
        cached_dev: PathBuf,
        /// Fast device holding cached data blocks.
        data_dev: PathBuf,
        /// Device keeping track of provisioned cache blocks.
        meta_dev: PathBuf,
        /// Cache unit size in sectors (power of two, >= 8).
        data_block_size: u64,
        /// Replacement policy or policy stack.
        #[arg(long, default_value = "mq")]
        policy: String,
    },
    /// Report `<free_blocks> <used_blocks> <dirty_blocks>` for a target.
    Status {
        data_dev: PathBuf,
        meta_dev: PathBuf,
        data_block_size: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Verify the metadata device: superblock, tree walks, bijection.
    Check {
        meta_dev: PathBuf,
        data_dev: PathBuf,
        data_block_size: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    free_blocks: u64,
    used_blocks: u64,
    dirty_blocks: u64,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    devices: usize,
    mappings: u64,
    dirty: u64,
    bijection_ok: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Create {
            cached_dev,
            data_dev,
            meta_dev,
            data_block_size,
            policy,
        } => create(&cached_dev, &data_dev, &meta_dev, data_block_size, &policy),
        Command::Status {
            data_dev,
            meta_dev,
            data_block_size,
            json,
        } => status(&data_dev, &meta_dev, data_block_size, json),
        Command::Check {
            meta_dev,
            data_dev,
            data_block_size,
            json,
        } => check(&meta_dev, &data_dev, data_block_size, json),
    }
}

fn parse_block_size(sectors: u64) -> Result<DataBlockSize> {
    DataBlockSize::new(sectors)
        .map_err(|err| anyhow::anyhow!("invalid data block size argument: {err}"))
}

fn open_metadata(
    meta_dev: &Path,
    data_dev: &Path,
    data_block_size: u64,
) -> Result<(CacheMetadata, u64)> {
    let block_size = parse_block_size(data_block_size)?;
    let data = FileByteDevice::open(data_dev)
        .with_context(|| format!("opening data device {}", data_dev.display()))?;
    let data_nr_blocks = data.len_bytes() / (block_size.sectors() * 512);
    let meta = FileByteDevice::open(meta_dev)
        .with_context(|| format!("opening metadata device {}", meta_dev.display()))?;
    let md = CacheMetadata::open(Box::new(meta), block_size, data_nr_blocks)
        .with_context(|| format!("opening cache metadata on {}", meta_dev.display()))?;
    Ok((md, data_nr_blocks))
}

fn create(
    cached_dev: &Path,
    data_dev: &Path,
    meta_dev: &Path,
    data_block_size: u64,
    policy: &str,
) -> Result<()> {
    let block_size = parse_block_size(data_block_size)?;
    let cached = FileByteDevice::open(cached_dev)
        .with_context(|| format!("opening cached device {}", cached_dev.display()))?;
    if cached.len_bytes() == 0 {
        bail!("cached device {} is empty", cached_dev.display());
    }

    let (md, data_nr_blocks) = open_metadata(meta_dev, data_dev, data_block_size)?;

    // Validate the policy string before reporting success.
    let built = policy_stack_create(policy, data_nr_blocks)
        .map_err(|err| anyhow::anyhow!("bad policy {policy:?}: {err}"))?;
    info!(
        event = "target_created",
        policy = built.name(),
        stacked = is_policy_stack_string(policy),
        data_nr_blocks
    );

    md.commit().context("committing fresh metadata")?;
    println!(
        "created: {} data blocks of {} sectors, policy {}",
        data_nr_blocks,
        block_size.sectors(),
        built.name()
    );
    Ok(())
}

fn count_dirty(md: &CacheMetadata) -> Result<u64> {
    let mut dirty = 0_u64;
    for dev in md.devices().context("listing devices")? {
        md.walk_mappings(dev, &mut |_ob, _pb, flags| {
            if flags & BLOCK_DIRTY != 0 {
                dirty += 1;
            }
            Ok(())
        })
        .context("walking mappings")?;
    }
    Ok(dirty)
}

fn status(data_dev: &Path, meta_dev: &Path, data_block_size: u64, json: bool) -> Result<()> {
    let (md, _) = open_metadata(meta_dev, data_dev, data_block_size)?;
    let used = md.get_provisioned_blocks(DEV);
    let total = md.get_data_dev_size(DEV);
    let output = StatusOutput {
        free_blocks: total.saturating_sub(used),
        used_blocks: used,
        dirty_blocks: count_dirty(&md)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "{} {} {}",
            output.free_blocks, output.used_blocks, output.dirty_blocks
        );
    }
    Ok(())
}

fn check(meta_dev: &Path, data_dev: &Path, data_block_size: u64, json: bool) -> Result<()> {
    let (md, _) = open_metadata(meta_dev, data_dev, data_block_size)?;

    let devices = md.devices().context("listing devices")?;
    let mut mappings = 0_u64;
    let mut dirty = 0_u64;
    let mut bijection_ok = true;

    for dev in &devices {
        md.walk_mappings(*dev, &mut |ob, pb, flags| {
            mappings += 1;
            if flags & BLOCK_DIRTY != 0 {
                dirty += 1;
            }
            match md.lookup_reverse(*dev, pb, true) {
                Ok(back) if back == ob => {}
                _ => bijection_ok = false,
            }
            Ok(())
        })
        .context("walking mappings")?;
    }

    let output = CheckOutput {
        devices: devices.len(),
        mappings,
        dirty,
        bijection_ok,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "devices={} mappings={} dirty={} bijection={}",
            output.devices,
            output.mappings,
            output.dirty,
            if output.bijection_ok { "ok" } else { "BROKEN" }
        );
    }
    if !output.bijection_ok {
        bail!("forward and reverse trees disagree");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sparse_file(bytes: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0_u8; bytes]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_block_size() {
        assert!(parse_block_size(8).is_ok());
        assert!(parse_block_size(64).is_ok());
        assert!(parse_block_size(7).is_err());
        assert!(parse_block_size(4).is_err());
    }

    #[test]
    fn test_create_then_status_round_trip() {
        let cached = sparse_file(64 * 4096);
        let data = sparse_file(16 * 4096);
        let meta = sparse_file(256 * 4096);

        create(cached.path(), data.path(), meta.path(), 8, "mq").unwrap();
        status(data.path(), meta.path(), 8, false).unwrap();
        check(meta.path(), data.path(), 8, true).unwrap();
    }

    #[test]
    fn test_create_rejects_bad_block_size() {
        let cached = sparse_file(4096);
        let data = sparse_file(4096);
        let meta = sparse_file(64 * 4096);
        assert!(create(cached.path(), data.path(), meta.path(), 12, "mq").is_err());
    }

    #[test]
    fn test_create_rejects_unknown_policy() {
        let cached = sparse_file(16 * 4096);
        let data = sparse_file(16 * 4096);
        let meta = sparse_file(256 * 4096);
        assert!(create(cached.path(), data.path(), meta.path(), 8, "lru").is_err());
    }
}
