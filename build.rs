// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

// Detects a nightly toolchain so the crate can use the native allocator API
// there instead of the stable polyfill. See src/compat.rs.

use rustc_version::{Channel, Result, version_meta};

fn main() -> Result<()> {
    if version_meta()?.channel == Channel::Nightly {
        println!("cargo:rustc-cfg=nightly");
    }
    Ok(())
}
