// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Bridges the allocator APIs between toolchains.
//!
//! On nightly the unstable `allocator_api` machinery in `core`/`alloc` is
//! used directly; on stable, `allocator-api2` (the conventional polyfill)
//! stands in for it. Everything else in the crate imports allocation types
//! from here and stays oblivious to the difference.

// The `nightly` cfg value is probed and set by the build script.

pub mod alloc {
    #[cfg(nightly)]
    pub use ::alloc::{alloc::Global, collections::TryReserveError};
    #[cfg(nightly)]
    pub use core::alloc::Allocator;

    #[cfg(not(nightly))]
    pub use allocator_api2::{
        alloc::{Allocator, Global},
        collections::TryReserveError,
    };
}

pub mod vec {
    #[cfg(nightly)]
    pub use ::alloc::vec::Vec;

    #[cfg(not(nightly))]
    pub use allocator_api2::vec::Vec;
}
