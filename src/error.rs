use std::{error::Error, fmt};

use backtrace::Backtrace;

/// The crate-wide error type. Every fallible operation in the page
/// engine, buffer pool, lock manager, log manager and applier returns
/// this (wrapped in [`crate::types::SmallResult`] or a richer `Result`)
/// rather than a family of error enums, matching how failures are
/// reported up through the C API this crate's on-disk formats are
/// compatible with: a short message plus, on request, a captured
/// backtrace for diagnosing where the failure originated.
#[derive(Debug)]
pub struct SmallError {
    details: String,
    backtrace: Backtrace,
}

impl SmallError {
    pub fn new(msg: &str) -> SmallError {
        SmallError {
            details: msg.to_string(),
            backtrace: Backtrace::new(),
        }
    }

    /// Print the backtrace captured at construction time to stderr.
    /// Call this at the point an error is first detected, since by the
    /// time it has propagated up through several `?`s the call stack
    /// recorded here is the only record of where things went wrong.
    pub fn show_backtrace(&self) {
        eprintln!("{}\n{:?}", self.details, self.backtrace);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.details)
    }
}

impl Error for SmallError {}

impl From<std::io::Error> for SmallError {
    fn from(e: std::io::Error) -> Self {
        SmallError::new(&e.to_string())
    }
}
