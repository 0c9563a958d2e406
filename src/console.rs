// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The console logger.
//!
//! Log records are written to standard error, one per line,
//! tagged with their level.  Standard output is left for the
//! audit report.

use log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;

struct Console;

static CONSOLE: Console = Console;

impl Log for Console {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut cons = std::io::stderr().lock();
        // Nowhere to report a failure to write to the console.
        let _ = writeln!(cons, "[{:<5}] {}", record.level(), record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

const LEVELS: [LevelFilter; 6] = [
    LevelFilter::Off,
    LevelFilter::Error,
    LevelFilter::Warn,
    LevelFilter::Info,
    LevelFilter::Debug,
    LevelFilter::Trace,
];

/// Returns `base` raised by `steps` levels of verbosity.
pub fn raise(base: LevelFilter, steps: u8) -> LevelFilter {
    let index = LEVELS.iter().position(|&l| l == base).unwrap_or(3);
    LEVELS[usize::min(index + usize::from(steps), LEVELS.len() - 1)]
}

/// Installs the console logger.  Only the first call has any
/// effect.
pub fn init(level: LevelFilter) {
    if log::set_logger(&CONSOLE).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raising_levels() {
        assert_eq!(raise(LevelFilter::Info, 0), LevelFilter::Info);
        assert_eq!(raise(LevelFilter::Info, 1), LevelFilter::Debug);
        assert_eq!(raise(LevelFilter::Warn, 9), LevelFilter::Trace);
        assert_eq!(raise(LevelFilter::Off, 1), LevelFilter::Error);
    }
}
