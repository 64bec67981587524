//! Process-group construction options.
//!
//! All values except the device list have defaults. `timeout` and
//! `threads` can be overridden via environment variables (prefixed
//! `COHORT_`).

use std::sync::Arc;
use std::time::Duration;

use crate::transport::TransportDevice;

/// Options for [`ProcessGroup::new`](crate::ProcessGroup::new).
pub struct GroupOptions {
    /// Transport devices; one context is connected per entry. Must be
    /// non-empty.
    pub devices: Vec<Arc<dyn TransportDevice>>,

    /// Wall-clock timeout applied to every transport operation.
    pub timeout: Duration,

    /// Worker pool size: the number of collectives that may execute in
    /// parallel within this group.
    pub threads: usize,
}

impl GroupOptions {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            timeout: Duration::from_secs(10),
            threads: 2,
        }
    }

    /// Append a transport device.
    pub fn device(mut self, device: Arc<dyn TransportDevice>) -> Self {
        self.devices.push(device);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Defaults with environment overrides applied.
    ///
    /// Recognized variables:
    /// - `COHORT_TIMEOUT_SECS`
    /// - `COHORT_THREADS`
    pub fn from_env() -> Self {
        let mut opts = Self::new();
        if let Ok(v) = std::env::var("COHORT_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                opts.timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("COHORT_THREADS") {
            if let Ok(n) = v.parse::<usize>() {
                opts.threads = n;
            }
        }
        opts
    }
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = GroupOptions::new();
        assert!(opts.devices.is_empty());
        assert_eq!(opts.timeout, Duration::from_secs(10));
        assert_eq!(opts.threads, 2);
    }

    #[test]
    fn test_builders() {
        let opts = GroupOptions::new()
            .timeout(Duration::from_secs(3))
            .threads(4);
        assert_eq!(opts.timeout, Duration::from_secs(3));
        assert_eq!(opts.threads, 4);
    }
}
