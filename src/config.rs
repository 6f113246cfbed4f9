//! Process-wide policy surface and persisted-state layout.
//!
//! `Config` is plain data, deserializable from the JSON the launcher may
//! supply; the core never reads a config file itself — only `Config`
//! values ever cross into this crate's functions. `Config::default()`
//! reproduces the fixed policy table and directory layout so a caller
//! that does nothing still gets sane, working defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Guest path prefixes that are always rejected (`PERM`/block),
    /// including the overlay's own on-disk storage mount.
    pub hard_blocked_prefixes: Vec<String>,
    /// Guest path prefixes forwarded straight to the host kernel.
    pub always_passthrough_prefixes: Vec<String>,
    /// The `/proc` prefix (normally just `"/proc"`).
    pub proc_prefix: String,
    /// The `/tmp` prefix (normally just `"/tmp"`).
    pub tmp_prefix: String,
    /// Host directory under which `cow/` and `tmp/` live.
    pub overlay_root: PathBuf,
    /// Fixed, short root for transient `execve` rewrite symlinks. Kept
    /// independent of `overlay_root`, which may be arbitrarily deep —
    /// the whole rewritten absolute path, not just its basename, has to
    /// fit inside the guest's original path buffer.
    pub exec_symlink_root: PathBuf,
    /// Max length, in bytes, of a rewritten absolute `execve` symlink
    /// path (root + separator + generated name).
    pub exec_symlink_name_len: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            hard_blocked_prefixes: vec![
                "/sys".to_string(),
                "/tmp/.sandkeeper-overlay".to_string(),
            ],
            always_passthrough_prefixes: vec!["/dev".to_string()],
            proc_prefix: "/proc".to_string(),
            tmp_prefix: "/tmp".to_string(),
            overlay_root: PathBuf::from("/tmp/.sandkeeper-overlay"),
            exec_symlink_root: PathBuf::from("/tmp"),
            exec_symlink_name_len: 7,
        }
    }
}

impl Config {
    pub fn cow_root(&self) -> PathBuf {
        self.overlay_root.join("cow")
    }

    pub fn tmp_root(&self) -> PathBuf {
        self.overlay_root.join("tmp")
    }

    pub fn from_json(data: &str) -> serde_json::Result<Config> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_fixed_policy_table() {
        let cfg = Config::default();
        assert!(cfg.hard_blocked_prefixes.iter().any(|p| p == "/sys"));
        assert!(cfg.always_passthrough_prefixes.iter().any(|p| p == "/dev"));
        assert_eq!(cfg.proc_prefix, "/proc");
        assert_eq!(cfg.tmp_prefix, "/tmp");
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back = Config::from_json(&json).unwrap();
        assert_eq!(back.proc_prefix, cfg.proc_prefix);
        assert_eq!(back.overlay_root, cfg.overlay_root);
    }
}
