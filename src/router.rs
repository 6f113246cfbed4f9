//! Path router.
//!
//! A pure function: given `(base directory, guest path)`, produce either
//! `Block` or `Handle { backend, normalized_path }`. Performs no I/O and
//! never follows symlinks; classification is purely lexical against the
//! policy table in `Config`.

use crate::config::Config;
use crate::error::{ErrorKind, Result};

/// Which backend a normalized guest path should be handled by.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Backend {
    Passthrough,
    Cow,
    Tmp,
    Proc,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Route {
    Block,
    Handle {
        backend: Backend,
        normalized_path: String,
    },
}

const MAX_PATH_LEN: usize = 4096;

/// Lexically normalizes a guest path: collapses `//`, resolves `.` and
/// `..` against the accumulated prefix. Never touches the filesystem.
/// `..` above the root is clamped at `/` (matching kernel path resolution,
/// which can't go above the root either).
fn normalize(path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&components.join("/"));
    out
}

/// Joins `base` and `user_path`: absolute paths ignore `base`; relative
/// paths are joined as `base + "/" + user_path`.
fn join(base: &str, user_path: &str) -> String {
    if user_path.starts_with('/') {
        user_path.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), user_path)
    }
}

/// Classifies a normalized guest path against the fixed policy table.
fn classify(config: &Config, normalized: &str) -> Route {
    for blocked in &config.hard_blocked_prefixes {
        if under(normalized, blocked) {
            return Route::Block;
        }
    }
    if under(normalized, &config.proc_prefix) {
        return Route::Handle {
            backend: Backend::Proc,
            normalized_path: normalized.to_string(),
        };
    }
    if under(normalized, &config.tmp_prefix) {
        return Route::Handle {
            backend: Backend::Tmp,
            normalized_path: normalized.to_string(),
        };
    }
    for passthrough in &config.always_passthrough_prefixes {
        if under(normalized, passthrough) {
            return Route::Handle {
                backend: Backend::Passthrough,
                normalized_path: normalized.to_string(),
            };
        }
    }
    Route::Handle {
        backend: Backend::Cow,
        normalized_path: normalized.to_string(),
    }
}

/// True if `path` is `prefix` itself or lexically under it.
fn under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// The router entry point. `base` is the caller's cwd (or the dirfd's
/// opened path) for relative lookups.
pub fn resolve_and_route(config: &Config, base: &str, user_path: &str) -> Result<Route> {
    if user_path.is_empty() {
        return Err(ErrorKind::NoEnt);
    }
    let joined = join(base, user_path);
    if joined.len() > MAX_PATH_LEN {
        return Err(ErrorKind::NameTooLong);
    }
    let normalized = normalize(&joined);
    if normalized.len() > MAX_PATH_LEN {
        return Err(ErrorKind::NameTooLong);
    }
    Ok(classify(config, &normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_is_noent() {
        let cfg = Config::default();
        assert_eq!(resolve_and_route(&cfg, "/", ""), Err(ErrorKind::NoEnt));
    }

    #[test]
    fn relative_path_joins_base() {
        let cfg = Config::default();
        let route = resolve_and_route(&cfg, "/home/guest", "x").unwrap();
        assert_eq!(
            route,
            Route::Handle {
                backend: Backend::Cow,
                normalized_path: "/home/guest/x".into()
            }
        );
    }

    #[test]
    fn absolute_path_ignores_base() {
        let cfg = Config::default();
        let route = resolve_and_route(&cfg, "/home/guest", "/tmp/x").unwrap();
        assert_eq!(
            route,
            Route::Handle {
                backend: Backend::Tmp,
                normalized_path: "/tmp/x".into()
            }
        );
    }

    #[test]
    fn dot_dot_collapses_lexically() {
        let cfg = Config::default();
        let route = resolve_and_route(&cfg, "/", "a/../b//c/./d").unwrap();
        assert_eq!(
            route,
            Route::Handle {
                backend: Backend::Cow,
                normalized_path: "/b/c/d".into()
            }
        );
    }

    #[test]
    fn dot_dot_above_root_clamps() {
        let cfg = Config::default();
        let route = resolve_and_route(&cfg, "/", "../../etc").unwrap();
        assert_eq!(
            route,
            Route::Handle {
                backend: Backend::Cow,
                normalized_path: "/etc".into()
            }
        );
    }

    #[test]
    fn hard_blocked_prefix_is_blocked() {
        let cfg = Config::default();
        assert_eq!(resolve_and_route(&cfg, "/", "/sys/kernel"), Ok(Route::Block));
    }

    #[test]
    fn dev_is_passthrough() {
        let cfg = Config::default();
        let route = resolve_and_route(&cfg, "/", "/dev/null").unwrap();
        assert_eq!(
            route,
            Route::Handle {
                backend: Backend::Passthrough,
                normalized_path: "/dev/null".into()
            }
        );
    }

    #[test]
    fn oversize_path_is_nametoolong() {
        let cfg = Config::default();
        let long = "/".to_string() + &"a".repeat(MAX_PATH_LEN + 1);
        assert_eq!(resolve_and_route(&cfg, "/", &long), Err(ErrorKind::NameTooLong));
    }

    #[test]
    fn routing_is_idempotent() {
        let cfg = Config::default();
        let route1 = resolve_and_route(&cfg, "/", "a/../b/./c").unwrap();
        let normalized = match &route1 {
            Route::Handle { normalized_path, .. } => normalized_path.clone(),
            Route::Block => panic!("unexpected block"),
        };
        let route2 = resolve_and_route(&cfg, "/", &normalized).unwrap();
        assert_eq!(route1, route2);
    }
}
