// Progress reporter
// Stateless: callers pass what they counted and what they expected.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub expected: u64,

    /// 0.0 ..= 100.0, rounded to two decimals
    pub percent: f64,

    /// More rows than expected (the expectation is stale, not an error)
    pub overshoot: bool,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.current >= self.expected
    }

    pub fn describe(&self) -> String {
        format!(
            "{} of {} processed ({:.2}%){}",
            self.current,
            self.expected,
            self.percent,
            if self.overshoot { " - more than expected" } else { "" }
        )
    }
}

/// Percentage of `expected` reached by `current`, clamped to 100.
/// Nothing expected means nothing left to do: 100%.
pub fn progress(current: u64, expected: u64) -> Progress {
    let percent = if expected == 0 {
        100.0
    } else {
        let raw = current as f64 * 100.0 / expected as f64;
        (raw.min(100.0) * 100.0).round() / 100.0
    };

    Progress {
        current,
        expected,
        percent,
        overshoot: current > expected,
    }
}
