use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Progress callback type (bytes_done, bytes_total)
///
/// May be invoked concurrently from several block tasks. Only the
/// aggregate `bytes_done` is monotonic, not the order of calls.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Shared byte counter feeding a [`ProgressFn`].
pub(crate) struct Progress {
    done: AtomicU64,
    total: u64,
    callback: Option<ProgressFn>,
}

impl Progress {
    pub(crate) fn new(total: u64, callback: Option<ProgressFn>) -> Arc<Self> {
        Arc::new(Self {
            done: AtomicU64::new(0),
            total,
            callback,
        })
    }

    pub(crate) fn advance(&self, bytes: u64) {
        let done = self.done.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if let Some(cb) = &self.callback {
            cb(done, self.total);
        }
    }

    pub(crate) fn done(&self) -> u64 {
        self.done.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_reports_cumulative_bytes() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let progress = Progress::new(
            10,
            Some(Arc::new(move |done, total| sink.lock().unwrap().push((done, total)))),
        );

        progress.advance(4);
        progress.advance(6);

        assert_eq!(progress.done(), 10);
        assert_eq!(*calls.lock().unwrap(), vec![(4, 10), (10, 10)]);
    }
}
