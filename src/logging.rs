// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Logging setup for the `vehicle` and `controller` binaries.
//!
//! Library code never initializes a logger itself; it only calls through
//! the `log` facade (`log::info!`, `log::warn!`, ...). The binaries call
//! [`init`] once at startup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes the global logger, honoring `RUBY_LOG` (falls back to `info`).
///
/// Safe to call more than once; only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::new().filter_or("RUBY_LOG", "info"))
            .format_timestamp_millis()
            .init();
    });
}
