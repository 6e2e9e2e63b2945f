// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Indirection over the synchronization primitives [`crate::scheduler`]
//! builds on, so the same scheduler code can run under `loom`'s model
//! checker (`--cfg loom`) instead of the real OS scheduler.
//!
//! Everything here is a straight re-export under normal builds; only the
//! `#[cfg(loom)]` arm differs.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::{Condvar, Mutex};
    } else {
        pub(crate) use std::sync::{Condvar, Mutex};
    }
}
