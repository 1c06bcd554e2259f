use std::time::Duration;

/// Tuning knobs recognized when a server is opened.
///
/// Each knob applies to exactly one backend and is ignored elsewhere, so a
/// single configuration value can be shipped across platforms unchanged.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Coalescing latency handed to FSEvents (macOS only). Changes occurring
    /// within one latency window may be merged into a single directory-level
    /// event. Clamped to at most [`WatchConfig::MAX_LATENCY`].
    pub latency: Duration,

    /// Size of the per-root event buffer handed to the OS (Windows only).
    /// Clamped to [`WatchConfig::MIN_BUFFER_BYTES`] ..=
    /// [`WatchConfig::MAX_BUFFER_BYTES`]. Larger buffers survive bigger event
    /// bursts before the OS reports an overflow.
    pub buffer_bytes: usize,
}

impl WatchConfig {
    pub const MIN_BUFFER_BYTES: usize = 4 * 1024;
    pub const MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;
    pub const MAX_LATENCY: Duration = Duration::from_secs(60);

    const DEFAULT_BUFFER_BYTES: usize = 64 * 1024;
    const DEFAULT_LATENCY: Duration = Duration::from_millis(300);

    /// Latency with the documented bounds applied.
    pub fn clamped_latency(&self) -> Duration {
        self.latency.min(Self::MAX_LATENCY)
    }

    /// Buffer size with the documented bounds applied.
    pub fn clamped_buffer_bytes(&self) -> usize {
        self.buffer_bytes
            .clamp(Self::MIN_BUFFER_BYTES, Self::MAX_BUFFER_BYTES)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            latency: Self::DEFAULT_LATENCY,
            buffer_bytes: Self::DEFAULT_BUFFER_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WatchConfig::default();
        assert_eq!(config.latency, Duration::from_millis(300));
        assert_eq!(config.buffer_bytes, 64 * 1024);
    }

    #[test]
    fn buffer_bytes_are_clamped() {
        let mut config = WatchConfig::default();

        config.buffer_bytes = 1;
        assert_eq!(config.clamped_buffer_bytes(), WatchConfig::MIN_BUFFER_BYTES);

        config.buffer_bytes = usize::MAX;
        assert_eq!(config.clamped_buffer_bytes(), WatchConfig::MAX_BUFFER_BYTES);

        config.buffer_bytes = 8 * 1024;
        assert_eq!(config.clamped_buffer_bytes(), 8 * 1024);
    }

    #[test]
    fn latency_is_clamped() {
        let mut config = WatchConfig::default();

        config.latency = Duration::from_secs(600);
        assert_eq!(config.clamped_latency(), WatchConfig::MAX_LATENCY);

        config.latency = Duration::ZERO;
        assert_eq!(config.clamped_latency(), Duration::ZERO);
    }
}
