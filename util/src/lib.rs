// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared pieces for the danessl command line tools.

use std::env;

use tracing_subscriber::EnvFilter;

/// Routes compact tracing output to the terminal for one binary.
///
/// `level` applies to the binary's own target and to the `danessl` crate;
/// anything in `RUST_LOG` is appended afterwards and can override both.
/// Everything else stays silent.
pub fn logger(bin: &str, level: tracing::Level) {
    let mut directives = format!("{bin}={level},danessl={level}");
    if let Ok(overrides) = env::var("RUST_LOG") {
        if !overrides.is_empty() {
            directives.push(',');
            directives.push_str(&overrides);
        }
    }

    let filter = directives
        .parse::<EnvFilter>()
        .expect("invalid RUST_LOG directive");

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .init();
}
