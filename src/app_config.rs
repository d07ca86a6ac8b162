//! Configuration file loading for CLI defaults.
//!
//! The file uses a flat `key = value` syntax (a TOML subset): strings are
//! double-quoted, `#` starts a comment outside strings, and unknown keys are
//! rejected.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use blogcrawl_core::crawler::ImageSize;

/// Defaults read from the configuration file. Command-line flags win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub download_root: Option<PathBuf>,
    pub index_dir: Option<PathBuf>,
    /// Netscape cookie export used for the session.
    pub cookie_file: Option<PathBuf>,
    pub concurrent_blogs: Option<u8>,
    pub concurrent_scans: Option<u8>,
    pub connections: Option<u16>,
    pub video_connections: Option<u16>,
    pub max_retries: Option<u8>,
    /// `svc` requests per minute; 0 disables pacing.
    pub svc_requests_per_minute: Option<u32>,
    pub image_size: Option<ImageSize>,
    pub video_size: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Validates values against the CLI ranges.
    pub fn validate(&self) -> Result<()> {
        validate_range("concurrent_blogs", self.concurrent_blogs, 1..=16)?;
        validate_range("concurrent_scans", self.concurrent_scans, 1..=32)?;
        validate_range("connections", self.connections, 1..=200)?;
        validate_range("video_connections", self.video_connections, 1..=64)?;
        validate_range("max_retries", self.max_retries, 0..=10)?;
        validate_range("svc_requests_per_minute", self.svc_requests_per_minute, 0..=6000)?;
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1..=3600)?;
        validate_range("read_timeout_secs", self.read_timeout_secs, 1..=3600)?;

        if let Some(video_size) = self.video_size
            && !matches!(video_size, 480 | 1080)
        {
            bail!("Invalid config value for `video_size`: {video_size}. Expected 480 or 1080");
        }
        Ok(())
    }
}

fn validate_range<T>(field: &str, value: Option<T>, range: std::ops::RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    let Some(value) = value else {
        return Ok(());
    };
    if !range.contains(&value) {
        bail!(
            "Invalid config value for `{field}`: {value}. Expected range: {}..={}",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Log filter used when neither `RUST_LOG` nor a CLI flag is given.
    #[must_use]
    pub fn filter(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose | Self::Debug => "debug",
            Self::Quiet => "error",
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/blogcrawl/config.toml`
/// 2. `$HOME/.config/blogcrawl/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("blogcrawl")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("blogcrawl")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit`, or the default path when it exists.
///
/// An explicit path must exist; a missing default file yields `None`.
pub fn load_config(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = explicit {
        return load_file_config(path).map(Some);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path).map(Some),
        _ => Ok(None),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "download_root" => {
                cfg.download_root = Some(parse_string_literal(value).with_context(context)?.into());
            }
            "index_dir" => {
                cfg.index_dir = Some(parse_string_literal(value).with_context(context)?.into());
            }
            "cookie_file" => {
                cfg.cookie_file = Some(parse_string_literal(value).with_context(context)?.into());
            }
            "concurrent_blogs" => {
                cfg.concurrent_blogs = Some(parse_integer(value).with_context(context)?);
            }
            "concurrent_scans" => {
                cfg.concurrent_scans = Some(parse_integer(value).with_context(context)?);
            }
            "connections" => cfg.connections = Some(parse_integer(value).with_context(context)?),
            "video_connections" => {
                cfg.video_connections = Some(parse_integer(value).with_context(context)?);
            }
            "max_retries" => cfg.max_retries = Some(parse_integer(value).with_context(context)?),
            "svc_requests_per_minute" => {
                cfg.svc_requests_per_minute = Some(parse_integer(value).with_context(context)?);
            }
            "image_size" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.image_size = Some(
                    parsed
                        .parse()
                        .with_context(|| format!("Invalid `image_size` '{parsed}' on line {line_no}"))?,
                );
            }
            "video_size" => cfg.video_size = Some(parse_integer(value).with_context(context)?),
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer(value).with_context(context)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer(value).with_context(context)?);
            }
            "verbosity" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.verbosity = Some(
                    parse_verbosity(&parsed)
                        .with_context(|| format!("Invalid `verbosity` '{parsed}' on line {line_no}"))?,
                );
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer<T>(raw_value: &str) -> Result<T>
where
    T: TryFrom<i128>,
{
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    T::try_from(value).map_err(|_| anyhow::anyhow!("Integer value {value} out of range"))
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        other => bail!("Expected one of default, verbose, quiet, debug; got '{other}'"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            # blogcrawl defaults
            download_root = "/data/blogs"
            cookie_file = "/home/u/cookies.txt" # exported from the browser
            concurrent_scans = 8
            connections = 16
            svc_requests_per_minute = 0
            image_size = "best"
            video_size = 480
            verbosity = "quiet"
        "#;
        let cfg = parse_config_str(raw).unwrap();
        assert_eq!(cfg.download_root, Some(PathBuf::from("/data/blogs")));
        assert_eq!(cfg.cookie_file, Some(PathBuf::from("/home/u/cookies.txt")));
        assert_eq!(cfg.concurrent_scans, Some(8));
        assert_eq!(cfg.connections, Some(16));
        assert_eq!(cfg.svc_requests_per_minute, Some(0));
        assert_eq!(cfg.image_size, Some(ImageSize::Best));
        assert_eq!(cfg.video_size, Some(480));
        assert_eq!(cfg.verbosity, Some(VerbositySetting::Quiet));
    }

    #[test]
    fn test_hash_inside_string_is_kept() {
        let cfg = parse_config_str(r#"download_root = "/data/#blogs""#).unwrap();
        assert_eq!(cfg.download_root, Some(PathBuf::from("/data/#blogs")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = parse_config_str("bogus = 1").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(parse_config_str("concurrent_scans = 0").is_err());
        assert!(parse_config_str("connections = 70000").is_err());
        assert!(parse_config_str("video_size = 720").is_err());
        assert!(parse_config_str("max_retries = -1").is_err());
    }

    #[test]
    fn test_missing_equals_rejected() {
        let err = parse_config_str("download_root").unwrap_err();
        assert!(err.to_string().contains("expected key = value"));
    }

    #[test]
    fn test_unquoted_string_rejected() {
        assert!(parse_config_str("cookie_file = cookies.txt").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        assert!(load_config(Some(Path::new("/nonexistent/blogcrawl.toml"))).is_err());
    }
}
