//! Caller-parameter error vocabulary.
//!
//! Only construction-time failures (spec §7 item 1) are represented here.
//! Exhaustion is a plain `None`/sentinel return, never an `Error`, and
//! invariant violations go through [`crate::hooks::AssertHook`] instead of
//! unwinding — see the module doc on `hooks` for the full taxonomy.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A memory block handed to `create_zone`/`add_block`/`give_pages` is
    /// smaller than the metadata it must carry.
    TooSmall { needed: usize, given: usize },
    /// `base` is not aligned to the required boundary.
    Unaligned { base: usize, align: usize },
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TooSmall { needed, given } => {
                write!(f, "block too small: need {needed} bytes, got {given}")
            }
            Error::Unaligned { base, align } => {
                write!(f, "base 0x{base:x} is not aligned to {align}")
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
