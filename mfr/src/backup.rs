//! Backup files, backup sets and the timestamps that name them

use std::sync::LazyLock;

use anyhow::{anyhow, Context};

const YYYYMMDD: &str = "[12][0-9]{3}[01][0-9][0-3][0-9]";
const HHMMSS: &str = "[012][0-9][0-5][0-9][0-5][0-9]";
const PRETTY_FORMAT: &str = "%Y-%B-%d %H:%M:%S";
const COMPACT_FORMAT: &str = "%Y%m%d%H%M%S";

static COMPACT_TIMESTAMP: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(&format!("^({YYYYMMDD})({HHMMSS})$")).unwrap());

// file name, mode and size as listed by the storage helper
static LISTED_FILE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(&format!(
        "(gp_[^ \t]*_({YYYYMMDD})({HHMMSS})[^ \t]*)[ \t]+([0-9]+)[ \t]+([0-9]+)"
    ))
    .unwrap()
});

static LISTED_DIR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(&format!(".*({YYYYMMDD})[ \t]+")).unwrap());

/// Identifies a backup set. Accepted forms are `YYYYMMDDHHMMSS`, `'YYYY-Month-DD HH:MM:SS'`
/// and the keywords `LATEST` and `OLDEST` (in any case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTimestamp {
    Latest,
    Oldest,
    At(chrono::NaiveDateTime),
}

impl BackupTimestamp {
    /// `YYYYMMDDHHMMSS`, or `None` for keywords.
    #[must_use]
    pub fn key(&self) -> Option<String> {
        match self {
            BackupTimestamp::At(dt) => Some(dt.format(COMPACT_FORMAT).to_string()),
            _ => None,
        }
    }

    /// Name of the directory holding backups taken on this day, or `None` for keywords.
    #[must_use]
    pub fn date_dir(&self) -> Option<String> {
        match self {
            BackupTimestamp::At(dt) => Some(dt.format("%Y%m%d").to_string()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_keyword(&self) -> bool {
        !matches!(self, BackupTimestamp::At(_))
    }

    fn from_compact(value: &str) -> Option<Self> {
        let caps = COMPACT_TIMESTAMP.captures(value)?;
        let date = chrono::NaiveDate::parse_from_str(&caps[1], "%Y%m%d").ok()?;
        let time = chrono::NaiveTime::parse_from_str(&caps[2], "%H%M%S").ok()?;
        Some(BackupTimestamp::At(date.and_time(time)))
    }
}

impl std::str::FromStr for BackupTimestamp {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "latest" => return Ok(BackupTimestamp::Latest),
            "oldest" => return Ok(BackupTimestamp::Oldest),
            _ => {}
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(value, PRETTY_FORMAT) {
            return Ok(BackupTimestamp::At(dt));
        }
        Self::from_compact(value).ok_or_else(|| {
            anyhow!(
                "invalid timestamp '{value}', expected one of: \
                'YYYY-Month-DD HH:MM:SS', YYYYMMDDHHMMSS, LATEST, OLDEST"
            )
        })
    }
}

impl std::fmt::Display for BackupTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BackupTimestamp::Latest => write!(f, "latest"),
            BackupTimestamp::Oldest => write!(f, "oldest"),
            BackupTimestamp::At(dt) => write!(
                f,
                "{} ({})",
                dt.format(PRETTY_FORMAT),
                dt.format(COMPACT_FORMAT)
            ),
        }
    }
}

/// A file stored on an endpoint. Two files are the same when name and size match.
#[derive(Debug, Clone)]
pub struct BackupFile {
    pub name: String,
    pub mode: String,
    pub size: u64,
}

impl BackupFile {
    pub fn new(name: impl Into<String>, mode: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            mode: mode.into(),
            size,
        }
    }

    /// Database dump files, excluding metadata and post-data files.
    #[must_use]
    pub fn is_dump_file(&self) -> bool {
        const METADATA_SUFFIXES: [&str; 8] = [
            "rpt",
            "ao_state_file",
            "co_state_file",
            "schema",
            "last_operation",
            "dirty_list",
            "table_list",
            "increments",
        ];
        self.name.starts_with("gp_dump")
            && !self.name.contains("post_data")
            && !METADATA_SUFFIXES
                .iter()
                .any(|suffix| self.name.ends_with(suffix))
    }

    /// Master or segment configuration archives.
    #[must_use]
    pub fn is_config_file(&self) -> bool {
        self.name.starts_with("gp_master_config_files")
            || self.name.starts_with("gp_segment_config_files")
    }
}

impl PartialEq for BackupFile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.size == other.size
    }
}

impl Eq for BackupFile {}

impl PartialOrd for BackupFile {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackupFile {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.name, self.size).cmp(&(&other.name, other.size))
    }
}

impl std::fmt::Display for BackupFile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:<50}\t{}\t{}", self.name, self.mode, self.size)
    }
}

/// Files in one date directory sharing one timestamp.
#[derive(Debug, Clone)]
pub struct BackupSet {
    date: String,
    time: String,
    files: Vec<BackupFile>,
    valid: Option<bool>,
}

impl BackupSet {
    pub fn new(date: &str, time: &str) -> anyhow::Result<Self> {
        BackupTimestamp::from_compact(&format!("{date}{time}"))
            .with_context(|| format!("invalid backup set identifier: '{date}' '{time}'"))?;
        Ok(Self {
            date: date.to_string(),
            time: time.to_string(),
            files: Vec::new(),
            valid: None,
        })
    }

    /// Builds a set from files. They are kept sorted by name and size.
    pub fn with_files(date: &str, time: &str, files: Vec<BackupFile>) -> anyhow::Result<Self> {
        let mut set = Self::new(date, time)?;
        set.files = files;
        set.files.sort();
        Ok(set)
    }

    pub fn add_file(&mut self, file: BackupFile) {
        let pos = self.files.partition_point(|f| f <= &file);
        self.files.insert(pos, file);
    }

    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{}", self.date, self.time)
    }

    #[must_use]
    pub fn date(&self) -> &str {
        &self.date
    }

    #[must_use]
    pub fn timestamp(&self) -> BackupTimestamp {
        BackupTimestamp::from_compact(&self.key()).unwrap_or(BackupTimestamp::Latest)
    }

    #[must_use]
    pub fn files(&self) -> &[BackupFile] {
        &self.files
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Path of `file` under `backup_dir` on an endpoint.
    #[must_use]
    pub fn path_of(&self, backup_dir: &str, file: &BackupFile) -> String {
        format!("{}/{}/{}", backup_dir, self.date, file.name)
    }

    /// `None` until [`BackupSet::validate`] has been called.
    #[must_use]
    pub fn is_valid(&self) -> Option<bool> {
        self.valid
    }

    /// A set is valid when it holds either no dump files or one per primary segment plus the
    /// master, and likewise for configuration archives.
    pub fn validate(&mut self, primary_segments: usize) -> bool {
        let expected = primary_segments + 1;
        let dumps = self.files.iter().filter(|f| f.is_dump_file()).count();
        let configs = self
            .files
            .iter()
            .filter(|f| !f.is_dump_file() && f.is_config_file())
            .count();
        let valid = (dumps == 0 || dumps == expected) && (configs == 0 || configs == expected);
        self.valid = Some(valid);
        valid
    }

    /// Same timestamp and same files.
    #[must_use]
    pub fn same_contents(&self, other: &BackupSet) -> bool {
        self.key() == other.key() && self.files == other.files
    }

    /// Table of the files in the set.
    #[must_use]
    pub fn files_table(&self) -> String {
        let mut table = format!(
            "  Backup Set: {}\n\t{:<50}\t{}\t{}\n  {}\n",
            self,
            "NAME",
            "MODE",
            "SIZE",
            "-".repeat(90)
        );
        for file in &self.files {
            table.push_str(&format!("\t{file}\n"));
        }
        table
    }
}

impl std::fmt::Display for BackupSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.timestamp())?;
        if self.valid == Some(false) {
            write!(f, " !")?;
        }
        Ok(())
    }
}

/// Groups the files found in a directory listing into backup sets, oldest first.
#[must_use]
pub fn parse_listing<S: AsRef<str>>(lines: &[S]) -> Vec<BackupSet> {
    let mut sets = std::collections::BTreeMap::<String, BackupSet>::new();
    for line in lines {
        let Some(caps) = LISTED_FILE.captures(line.as_ref()) else {
            continue;
        };
        let Ok(size) = caps[5].parse::<u64>() else {
            tracing::debug!("ignoring listing line with bad size: {}", line.as_ref());
            continue;
        };
        let (date, time) = (&caps[2], &caps[3]);
        let key = format!("{date}{time}");
        if !sets.contains_key(&key) {
            match BackupSet::new(date, time) {
                Ok(set) => {
                    sets.insert(key.clone(), set);
                }
                Err(error) => {
                    tracing::debug!("{:#}", error);
                    continue;
                }
            }
        }
        if let Some(set) = sets.get_mut(&key) {
            set.add_file(BackupFile::new(&caps[1], &caps[4], size));
        }
    }
    sets.into_values().collect()
}

/// Date directories (`YYYYMMDD`) found in a listing of the default backup directory.
#[must_use]
pub fn parse_backup_dirs<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| !LISTED_FILE.is_match(line))
        .filter_map(|line| LISTED_DIR.captures(line).map(|caps| caps[1].to_string()))
        .collect()
}
