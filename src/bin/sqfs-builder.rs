//! sqfs-builder - build a SquashFS image from a tar archive or a directory.
//!
//! Usage:
//!   sqfs-builder out.sqfs rootfs.tar.zst        # archive file (plain, gzip or zstd)
//!   sqfs-builder out.sqfs staging/              # live directory
//!   tar -c . | sqfs-builder out.sqfs            # archive on stdin
//!   sqfs-builder --strip=1 -c zstd out.sqfs pkg-1.0.tar.gz

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use sqfs_builder::artifact::squashfs::build_squashfs;
use sqfs_builder::config::{load_config, BuildConfig};
use sqfs_builder::source::{DirectorySource, EntrySource, TarSource};
use sqfs_builder::ImageSummary;

#[derive(Parser)]
#[command(name = "sqfs-builder", version)]
#[command(about = "Build a SquashFS image from a tar archive or a directory tree")]
struct Args {
    /// Image to create (must not exist)
    output: PathBuf,

    /// Tar archive or directory to read; stdin when absent or "-"
    source: Option<PathBuf>,

    /// Remove N leading path components from every entry
    #[arg(long, value_name = "N")]
    strip: Option<usize>,

    /// Compressor: zlib, zstd or none
    #[arg(short, long)]
    compressor: Option<String>,

    /// log2 of the data block size (12-20)
    #[arg(short, long)]
    block_log: Option<u16>,

    /// Compression level
    #[arg(short, long)]
    level: Option<i32>,

    /// Compress and write on the main thread
    #[arg(short, long)]
    single_threaded: bool,

    /// Number of compression workers
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Store duplicate files separately
    #[arg(long)]
    no_dedup: bool,

    /// Skip entries that cannot be stored instead of failing
    #[arg(long)]
    lenient: bool,

    /// TOML build config; flags override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the build summary as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn build_config(&self) -> Result<BuildConfig> {
        let mut cfg = match &self.config {
            Some(path) => load_config(path)?,
            None => BuildConfig::default(),
        };
        let image = &mut cfg.image;
        if self.compressor.is_some() {
            image.compressor.clone_from(&self.compressor);
        }
        if self.block_log.is_some() {
            image.block_log = self.block_log;
        }
        if self.level.is_some() {
            image.compression_level = self.level;
        }
        if self.workers.is_some() {
            image.workers = self.workers;
        }
        if self.single_threaded {
            image.single_threaded = Some(true);
        }
        if self.no_dedup {
            image.dedup = Some(false);
        }
        if self.strip.is_some() {
            cfg.source.strip = self.strip;
        }
        if self.lenient {
            cfg.source.lenient = Some(true);
        }
        Ok(cfg)
    }
}

fn open_source(source: Option<&Path>) -> Result<Box<dyn EntrySource>> {
    match source {
        None => Ok(Box::new(TarSource::stdin()?)),
        Some(p) if p == Path::new("-") => Ok(Box::new(TarSource::stdin()?)),
        Some(p) if p.is_dir() => Ok(Box::new(DirectorySource::new(p))),
        Some(p) => Ok(Box::new(TarSource::open(p)?)),
    }
}

fn print_summary(summary: &ImageSummary, output: &Path, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(summary).context("serializing build summary")?;
        println!("{text}");
    } else {
        println!(
            "{}: {} bytes, {} inodes, {} fragments, {} ids, {} {}K blocks",
            output.display(),
            summary.image_size,
            summary.inode_count,
            summary.fragment_count,
            summary.id_count,
            summary.compressor,
            summary.block_size / 1024
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = args.build_config()?.squashfs_options()?;
    let mut source = open_source(args.source.as_deref())?;
    let summary = build_squashfs(source.as_mut(), &args.output, &options).with_context(|| {
        format!("building SquashFS image '{}'", args.output.display())
    })?;
    print_summary(&summary, &args.output, args.json)
}
