/// Default for [`Config::large_threshold`]: 128 KiB.
pub const DEFAULT_LARGE_THRESHOLD: usize = 128 * 1024;

/// Default for [`Config::min_region_size`]: 128 KiB.
pub const DEFAULT_MIN_REGION_SIZE: usize = 128 * 1024;

/// Tunables of an [`crate::Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Requests whose aligned size plus block header reach this many bytes get
    /// a mapping of their own instead of a block inside a region.
    /// Default: [`DEFAULT_LARGE_THRESHOLD`].
    pub large_threshold: usize,

    /// Smallest region requested from the OS, before rounding to whole pages.
    /// Bigger regions mean fewer syscalls for many small allocations.
    /// Default: [`DEFAULT_MIN_REGION_SIZE`].
    pub min_region_size: usize,

    /// Give a region back to the OS as soon as all of it is free again.
    /// When false, regions are kept until the allocator is dropped.
    /// Default: false.
    pub release_empty_regions: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Configuration with every field set to its default.
    pub const fn new() -> Self {
        Self {
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            min_region_size: DEFAULT_MIN_REGION_SIZE,
            release_empty_regions: false,
        }
    }

    #[must_use]
    pub const fn with_large_threshold(mut self, large_threshold: usize) -> Self {
        self.large_threshold = large_threshold;
        self
    }

    #[must_use]
    pub const fn with_min_region_size(mut self, min_region_size: usize) -> Self {
        self.min_region_size = min_region_size;
        self
    }

    #[must_use]
    pub const fn with_release_empty_regions(mut self, release_empty_regions: bool) -> Self {
        self.release_empty_regions = release_empty_regions;
        self
    }

    /// Whether a block of `size` bytes (aligned) goes to a standalone mapping.
    #[inline]
    pub(crate) fn is_large(&self, size: usize, header_size: usize) -> bool {
        size.saturating_add(header_size) >= self.large_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::default()
            .with_large_threshold(1 << 20)
            .with_min_region_size(4096)
            .with_release_empty_regions(true);

        assert_eq!(1 << 20, config.large_threshold);
        assert_eq!(4096, config.min_region_size);
        assert!(config.release_empty_regions);
        assert!(!Config::default().release_empty_regions);
    }

    #[test]
    fn threshold_is_inclusive() {
        let config = Config::default();

        assert!(!config.is_large(DEFAULT_LARGE_THRESHOLD - 64, 48));
        assert!(config.is_large(DEFAULT_LARGE_THRESHOLD - 48, 48));
        assert!(config.is_large(usize::MAX, 48));
    }
}
