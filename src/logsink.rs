//! Ordered warning sink (§A). Warnings named in §7 — unresolved copy source
//! falling back to inline content, mismatched preprocessor nesting, refname
//! remapping, label ambiguity — go through here instead of `tracing::warn!`
//! alone, so a log file can replay them in strict revision order even though
//! the scheduler may complete branches out of order.

use tracing::warn;

pub trait LogSink: Send + Sync {
    fn warn(&self, rev_ordinal: u64, message: &str);
}

/// Emits to `tracing` only; the default when no run log is configured.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn warn(&self, rev_ordinal: u64, message: &str) {
        warn!(rev = rev_ordinal, "{message}");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct VecLogSink(pub Mutex<Vec<(u64, String)>>);

    impl LogSink for VecLogSink {
        fn warn(&self, rev_ordinal: u64, message: &str) {
            self.0.lock().unwrap().push((rev_ordinal, message.to_string()));
        }
    }
}
