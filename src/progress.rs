use log::info;

/// Receives progress updates from long-running burner operations.
///
/// For an operation of `total` bytes the sink is called once with
/// `(0, total)` when the operation starts, periodically while it runs and
/// once with `(total, total)` when it completes. Emission stops at the
/// point of failure.
pub trait ProgressSink {
    fn progress(&mut self, current: u64, total: u64);
}

impl<F: FnMut(u64, u64)> ProgressSink for F {
    fn progress(&mut self, current: u64, total: u64) {
        self(current, total)
    }
}

/// Discards all updates.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&mut self, _current: u64, _total: u64) {}
}

/// Default sink installed by the burners: reports whole-percent steps
/// through the logger.
pub struct LogProgress {
    last_percent: Option<u64>,
}

impl LogProgress {
    pub fn new() -> Self {
        Self { last_percent: None }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for LogProgress {
    fn progress(&mut self, current: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = current * 100 / total;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            info!("progress {}% [{}/{}]", percent, current, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_sinks() {
        let mut seen = Vec::new();
        {
            let mut sink = |current: u64, total: u64| seen.push((current, total));
            sink.progress(0, 10);
            sink.progress(10, 10);
        }
        assert_eq!(seen, vec![(0, 10), (10, 10)]);
    }
}
