//! Indirect calls for diagnostics, re-architected from the original's
//! preprocessor `WARN_HANDLER`/`ASSERT` macros into traits so a zone's
//! configuration type can carry its own policy.
//!
//! The default implementations log parameter warnings through `log::warn!`
//! and panic on invariant violations, matching a well-behaved embedded
//! build; a caller targeting a release image with `DEBUG=0` semantics can
//! swap in a [`Hooks`] impl whose `on_invariant_violation` is empty.

/// Fires for caller-parameter errors (spec §7 item 1). Advisory only —
/// never affects control flow.
pub trait WarnHook {
    fn warn(&self, message: core::fmt::Arguments<'_>);
}

/// Fires for invariant violations (spec §7 item 3) — corrupted bitmaps, a
/// bad `prev_physical`, a double-free caught under a debug build. Fatal by
/// default; the only fail-fast path in the crate.
pub trait AssertHook {
    fn on_invariant_violation(&self, message: core::fmt::Arguments<'_>) -> !;
}

/// The hook set a zone is parametrized over. One impl per policy; zero-sized
/// types are the expected case.
pub trait Hooks: WarnHook + AssertHook {}
impl<T: WarnHook + AssertHook> Hooks for T {}

/// `log::warn!` for parameter errors, `panic!` for invariant violations.
/// What every zone uses unless the caller opts into something else.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl WarnHook for DefaultHooks {
    fn warn(&self, message: core::fmt::Arguments<'_>) {
        log::warn!("{message}");
    }
}

impl AssertHook for DefaultHooks {
    fn on_invariant_violation(&self, message: core::fmt::Arguments<'_>) -> ! {
        panic!("{message}");
    }
}

/// Silences both hooks. Useful for a release build that wants `ASSERT` to
/// compile away to nothing rather than panic — note this does not make
/// corruption safe, it just stops the crate from reporting it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentHooks;

impl WarnHook for SilentHooks {
    fn warn(&self, _message: core::fmt::Arguments<'_>) {}
}

impl AssertHook for SilentHooks {
    fn on_invariant_violation(&self, _message: core::fmt::Arguments<'_>) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}

/// Invariant check that always runs (including release builds), the way
/// the original's `ASSERT(x)` macro expands. Panics through the zone's
/// [`AssertHook`] rather than calling `core::panic!` directly so a caller's
/// policy is respected.
macro_rules! zone_assert {
    ($hooks:expr, $cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::hooks::AssertHook::on_invariant_violation(&$hooks, format_args!($($arg)*));
        }
    };
}

pub(crate) use zone_assert;
