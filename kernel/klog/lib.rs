//! Profile-gated logging for the network core (`klog`).
//!
//! Every module of the packet-processing core logs through these macros
//! instead of talking to a logger directly. The crate stays tiny so that any
//! sub-crate can depend on it without pulling in the rest of the workspace.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Secure-gated | Worker banners, status messages |
//!
//! # Hardening Profile Integration
//!
//! Filtering is **runtime** and derived from the active hardening profile.
//! The embedding environment calls [`set_profile`] once at start-up:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! The hot path is a single `Relaxed` atomic load + integer compare.
//!
//! # Sink
//!
//! Messages that pass the filter are handed to the [`log`] facade under the
//! `"klog"` target, so whichever logger the host installs decides where the
//! text ends up.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Trace`](Level::Trace)) to most severe
/// ([`Error`](Level::Error)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

impl From<Level> for log::Level {
    fn from(level: Level) -> Self {
        match level {
            Level::Trace => log::Level::Trace,
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        }
    }
}

// ============================================================================
// Profile Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Target name used for every record forwarded to the `log` facade.
pub const TARGET: &str = "klog";

/// Runtime minimum level. Messages with `level >= LOG_MIN_LEVEL` are emitted.
/// Starts DISABLED until [`set_profile`] is called.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Runtime gate for [`klog_always!`]. Fail-closed until [`set_profile`].
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Hardening profiles understood by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// No klog output at all.
    Secure = 0,
    /// Errors and warnings only.
    Balanced = 1,
    /// All levels.
    Performance = 2,
}

/// Set the klog filter from a profile.
///
/// Safe to call again if the profile changes at runtime. The `Secure`
/// profile also silences [`klog_always!`].
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Disable all klog output. Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Output Helpers (used by macros, not public API)
// ============================================================================

#[doc(hidden)]
#[inline]
pub fn _klog_print(level: Level, args: core::fmt::Arguments) {
    log::log!(target: TARGET, level.into(), "{}", args);
}

// ============================================================================
// Macros
// ============================================================================

/// Profile-gated status output (worker start/stop banners).
///
/// Suppressed in [`KlogProfile::Secure`]. Emitted at `Info` on the facade.
#[macro_export]
macro_rules! klog_always {
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print($crate::Level::Info, format_args!($($arg)+));
        }
    }};
}

/// Profile-aware logging.
///
/// `Debug` and `Trace` levels are additionally compiled out in release builds.
///
/// # Examples
///
/// ```ignore
/// klog!(Warn,  "handle_tcp: no packet buffer for RST to {}", peer);
/// klog!(Debug, "handle_ipv4: unhandled protocol {:#04x}", proto);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print($crate::Level::Error, format_args!($($arg)+));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print($crate::Level::Warn, format_args!($($arg)+));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print($crate::Level::Info, format_args!($($arg)+));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print($crate::Level::Debug, format_args!($($arg)+));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print($crate::Level::Trace, format_args!($($arg)+));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    // Profiles are process-global, so the whole sequence lives in one test.
    #[test]
    fn test_profile_filtering() {
        assert!(!enabled(Level::Error));
        assert!(!_klog_always_enabled());

        set_profile(KlogProfile::Balanced);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));
        assert!(_klog_always_enabled());

        set_profile(KlogProfile::Performance);
        assert!(enabled(Level::Trace));

        disable();
        assert!(!enabled(Level::Error));
        assert!(_klog_always_enabled());

        set_profile(KlogProfile::Secure);
        assert!(!enabled(Level::Error));
        assert!(!_klog_always_enabled());

        // Must not panic with no logger installed.
        klog!(Error, "dropped {}", 1);
        klog_always!("banner");
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(log::Level::from(Level::Warn), log::Level::Warn);
        assert!(Level::Trace < Level::Error);
    }
}
