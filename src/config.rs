//! Switch configuration: a line-oriented `key:value` file written by the
//! emulator next to the node's log file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::warn;

/// Which octet of a compute-subnet IPv4 address becomes the root VID
/// (1-based; the default picks octet C of A.B.C.D).
pub const DEFAULT_VID_OCTET: u8 = 3;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub tier: u8,
    pub is_top_spine: bool,
    pub is_leaf: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg = Config::parse(&text);
        if cfg.tier == 0 {
            bail!("config {} has no valid `tier` entry", path.display());
        }
        Ok(cfg)
    }

    /// Parse `key:value` lines. Unknown keys and malformed lines are logged
    /// and skipped.
    pub fn parse(text: &str) -> Self {
        let mut cfg = Config::default();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                warn!("skipping malformed config line: {line}");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "isTopSpine" => cfg.is_top_spine = value == "True",
                "tier" => match value.parse::<u8>() {
                    Ok(tier) => {
                        cfg.tier = tier;
                        // tier 0 is the compute tier; only tier 1 is a leaf
                        cfg.is_leaf = tier == 1;
                    }
                    Err(_) => warn!("ignoring unparsable tier value: {value}"),
                },
                _ => warn!("ignoring unknown config key: {key}"),
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_leaf() {
        let cfg = Config::parse("isTopSpine:False\ntier:1\n");
        assert_eq!(cfg.tier, 1);
        assert!(cfg.is_leaf);
        assert!(!cfg.is_top_spine);
    }

    #[test]
    fn test_parse_top_spine() {
        let cfg = Config::parse("isTopSpine:True\ntier:3\n");
        assert_eq!(cfg.tier, 3);
        assert!(!cfg.is_leaf);
        assert!(cfg.is_top_spine);
    }

    #[test]
    fn test_unknown_keys_and_malformed_lines_are_skipped() {
        let cfg = Config::parse("bogus\ncolor:blue\ntier:2\n\n");
        assert_eq!(cfg.tier, 2);
        assert!(!cfg.is_leaf);
    }

    #[test]
    fn test_bad_tier_value_is_ignored() {
        let cfg = Config::parse("tier:many\n");
        assert_eq!(cfg.tier, 0);
    }
}
