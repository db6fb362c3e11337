//! Configuration types for runtime and output settings

/// Runtime configuration for tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    #[must_use]
    pub fn level_filter(&self) -> tracing::level_filters::LevelFilter {
        match self.verbose {
            0 => tracing::level_filters::LevelFilter::ERROR,
            1 => tracing::level_filters::LevelFilter::INFO,
            2 => tracing::level_filters::LevelFilter::DEBUG,
            _ => tracing::level_filters::LevelFilter::TRACE,
        }
    }

    /// How byte progress should be shown for this output configuration.
    #[must_use]
    pub fn progress_mode(&self) -> crate::ProgressMode {
        if self.quiet {
            crate::ProgressMode::Log
        } else {
            crate::ProgressMode::Bar
        }
    }
}
