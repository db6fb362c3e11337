use tracing::instrument;

/// How byte progress is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ProgressMode {
    /// Animated progress bar on stderr
    #[default]
    Bar,
    /// A line on stdout each time another tenth of the total is done
    Log,
    /// Nothing
    Off,
}

/// Reports progress of work measured in bytes towards a known goal.
#[derive(Debug)]
pub struct ByteProgress {
    label: String,
    goal: u64,
    mode: ProgressMode,
    bar: Option<indicatif::ProgressBar>,
    last_tenth: u64,
    start_time: std::time::Instant,
}

impl ByteProgress {
    pub fn new(label: impl Into<String>, goal: u64, mode: ProgressMode) -> Self {
        let label = label.into();
        let bar = (mode == ProgressMode::Bar).then(|| {
            let bar = indicatif::ProgressBar::new(goal);
            bar.set_style(
                indicatif::ProgressStyle::with_template(
                    "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("=> "),
            );
            bar.set_message(label.clone());
            bar
        });
        Self {
            label,
            goal,
            mode,
            bar,
            last_tenth: 0,
            start_time: std::time::Instant::now(),
        }
    }

    #[must_use]
    pub fn goal(&self) -> u64 {
        self.goal
    }

    /// Returns the number of completed tenths of the goal. An empty goal counts as done.
    #[must_use]
    pub fn tenths(done: u64, goal: u64) -> u64 {
        if goal == 0 {
            return 10;
        }
        (u128::from(done.min(goal)) * 10 / u128::from(goal)) as u64
    }

    /// Records the amount done so far. `detail` is only evaluated when a text update is printed.
    #[instrument(skip(self, detail))]
    pub fn update(&mut self, done: u64, detail: impl FnOnce() -> String) {
        match self.mode {
            ProgressMode::Bar => {
                if let Some(bar) = &self.bar {
                    bar.set_position(done);
                }
            }
            ProgressMode::Log => {
                let tenth = Self::tenths(done, self.goal);
                if tenth > self.last_tenth {
                    self.last_tenth = tenth;
                    // text updates go to stdout regardless of the log level
                    println!("{}", self.text_update(done, tenth, &detail()));
                }
            }
            ProgressMode::Off => {}
        }
    }

    fn text_update(&self, done: u64, tenth: u64, detail: &str) -> String {
        format!(
            "{}: {} of {} done ({}%), {}",
            self.label,
            bytesize::ByteSize(done),
            bytesize::ByteSize(self.goal),
            tenth * 10,
            detail
        )
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
        tracing::debug!(
            "{} finished after {}",
            self.label,
            humantime::format_duration(std::time::Duration::from_secs(
                self.elapsed().as_secs()
            ))
        );
    }
}

impl Drop for ByteProgress {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.as_ref().filter(|bar| !bar.is_finished()) {
            bar.abandon();
        }
    }
}
