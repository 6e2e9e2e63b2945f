// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Same indirection as `pt_core::loom`, for the `Mutex`/atomics this
//! crate's own primitives use around the value/state they guard.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::Mutex;
        pub(crate) use loom::sync::atomic::AtomicBool;
    } else {
        pub(crate) use std::sync::Mutex;
        pub(crate) use std::sync::atomic::AtomicBool;
    }
}
