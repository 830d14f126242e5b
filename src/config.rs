//! TOML build configuration.
//!
//! ```toml
//! [image]
//! block_log = 17
//! compressor = "zstd"
//! compression_level = 19
//! workers = 8
//! single_threaded = false
//! dedup = true
//!
//! [source]
//! strip = 1
//! lenient = false
//! ```
//!
//! Every key is optional. Unset keys fall back to [`ImageOptions::default`].

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::artifact::squashfs::SquashfsOptions;
use crate::compress::CompressorKind;
use crate::data::Threading;
use crate::format::{BLOCK_LOG_MAX, BLOCK_LOG_MIN};
use crate::image::ImageOptions;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub image: ImageSection,
    #[serde(default)]
    pub source: SourceSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    pub block_log: Option<u16>,
    pub compressor: Option<String>,
    pub compression_level: Option<i32>,
    pub workers: Option<usize>,
    pub single_threaded: Option<bool>,
    pub dedup: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    pub strip: Option<usize>,
    pub lenient: Option<bool>,
}

pub fn load_config(path: &Path) -> Result<BuildConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading build config '{}'", path.display()))?;
    parse_config(&text).with_context(|| format!("parsing build config '{}'", path.display()))
}

pub fn parse_config(text: &str) -> Result<BuildConfig> {
    let parsed: BuildConfig = toml::from_str(text)?;
    // Surface bad values at load time rather than at build time.
    parsed.image_options()?;
    Ok(parsed)
}

impl BuildConfig {
    pub fn image_options(&self) -> Result<ImageOptions> {
        let image = &self.image;
        let mut options = ImageOptions::default();

        if let Some(block_log) = image.block_log {
            if !(BLOCK_LOG_MIN..=BLOCK_LOG_MAX).contains(&block_log) {
                bail!(
                    "invalid image.block_log {block_log}: expected {BLOCK_LOG_MIN}..={BLOCK_LOG_MAX}"
                );
            }
            options.block_log = block_log;
        }
        if let Some(name) = &image.compressor {
            options.compressor = name
                .parse::<CompressorKind>()
                .context("invalid image.compressor")?;
        }
        if let Some(level) = image.compression_level {
            // Build once to reject out-of-range levels for this codec.
            options
                .compressor
                .build(Some(level))
                .with_context(|| format!("invalid image.compression_level {level}"))?;
            options.compression_level = Some(level);
        }
        options.threading = match (image.single_threaded, image.workers) {
            (Some(true), _) | (_, Some(0)) => Threading::SingleThreaded,
            (_, Some(n)) => Threading::Workers(n),
            _ => Threading::default(),
        };
        if let Some(dedup) = image.dedup {
            options.dedup = dedup;
        }
        Ok(options)
    }

    pub fn squashfs_options(&self) -> Result<SquashfsOptions> {
        Ok(SquashfsOptions {
            image: self.image_options()?,
            strip: self.source.strip.unwrap_or(0),
            lenient: self.source.lenient.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_is_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg, BuildConfig::default());
        let opts = cfg.squashfs_options().unwrap();
        assert_eq!(opts.image, ImageOptions::default());
        assert_eq!(opts.strip, 0);
        assert!(!opts.lenient);
    }

    #[test]
    fn test_full_config() {
        let cfg = parse_config(
            r#"
            [image]
            block_log = 12
            compressor = "zstd"
            compression_level = 3
            workers = 4
            dedup = false

            [source]
            strip = 1
            lenient = true
            "#,
        )
        .unwrap();
        let opts = cfg.squashfs_options().unwrap();
        assert_eq!(opts.image.block_log, 12);
        assert_eq!(opts.image.compressor, CompressorKind::Zstd);
        assert_eq!(opts.image.compression_level, Some(3));
        assert_eq!(opts.image.threading, Threading::Workers(4));
        assert!(!opts.image.dedup);
        assert_eq!(opts.strip, 1);
        assert!(opts.lenient);
    }

    #[test]
    fn test_single_threaded_wins_over_workers() {
        let cfg = parse_config("[image]\nworkers = 8\nsingle_threaded = true\n").unwrap();
        assert_eq!(cfg.image_options().unwrap().threading, Threading::SingleThreaded);
        let cfg = parse_config("[image]\nworkers = 0\n").unwrap();
        assert_eq!(cfg.image_options().unwrap().threading, Threading::SingleThreaded);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = parse_config("[image]\nblocksize = 4096\n").unwrap_err();
        assert!(format!("{err:#}").contains("blocksize"));
    }

    #[test]
    fn test_errors_name_the_field() {
        let err = parse_config("[image]\nblock_log = 40\n").unwrap_err();
        assert!(err.to_string().contains("image.block_log"));

        let err = parse_config("[image]\ncompressor = \"lzma\"\n").unwrap_err();
        assert!(err.to_string().contains("image.compressor"));

        let err = parse_config("[image]\ncompressor = \"zlib\"\ncompression_level = 42\n")
            .unwrap_err();
        assert!(err.to_string().contains("image.compression_level"));
    }

    #[test]
    fn test_load_config_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.toml");
        fs::write(&path, "[source]\nstrip = \"two\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("build.toml"));

        let missing = load_config(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(missing.to_string().contains("reading build config"));
    }
}
