//! Three cooperating embedded allocators for systems without an OS heap:
//! a buddy page allocator ([`buddy`]), a slab allocator for fixed-size
//! objects ([`slab`]), and a TLSF allocator for variable-size requests
//! with bounded worst-case time ([`tlsf`]). Each is generic over its
//! compile-time parameters (page shift, order count, `FL`/`SL`) rather
//! than instantiated through a preprocessor prefix, and none holds
//! internal locks — a caller wanting one behind a shared reference reaches
//! for [`locked::Locked`].
//!
//! Grounded in the same crate this workspace started from
//! (`harikrishnan94-meiOS`'s `libmei::vm`), generalized from its one
//! AArch64 kernel target to a parametrized, reusable trio.

#![cfg_attr(not(test), no_std)]
#![feature(allocator_api)]

pub mod addr;
pub mod buddy;
pub mod error;
pub mod hooks;
pub mod locked;
pub mod slab;
pub mod tlsf;

pub use addr::Addr;
pub use error::{Error, Result};
