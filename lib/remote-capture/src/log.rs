// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Logger construction.

use slog::Drain;
use slog::Logger;

/// Build the root logger: terminal output, filtered by `RUST_LOG`, drained
/// asynchronously.
///
/// Without `RUST_LOG` only errors are printed, so set e.g.
/// `RUST_LOG=info` (or `remote_capture=debug`) to follow a session.
pub fn init() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!())
}

/// A logger that drops everything.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}
