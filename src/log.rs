//! Thin logging facade.
//!
//! Handler code logs through `log!(LogDebug, "...", args)` call sites, with
//! `tracing` as the sink rather than a hand-rolled buffer, so the
//! supervisor's embedder can filter/format/collect spans with the rest of
//! the ecosystem's tooling.

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LogLevel {
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
    LogTrace,
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            $crate::log::LogLevel::LogError => tracing::error!($($arg)+),
            $crate::log::LogLevel::LogWarn => tracing::warn!($($arg)+),
            $crate::log::LogLevel::LogInfo => tracing::info!($($arg)+),
            $crate::log::LogLevel::LogDebug => tracing::debug!($($arg)+),
            $crate::log::LogLevel::LogTrace => tracing::trace!($($arg)+),
        }
    };
}

/// Installs a default `tracing` subscriber if the embedding process hasn't
/// already set one up. Library code calls this once, from
/// `Supervisor::new`; it is a no-op (returns `Err`, ignored) if a global
/// subscriber is already installed, since embedders configuring their own
/// subscriber take priority.
pub fn init_default_subscriber() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SANDKEEPER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
