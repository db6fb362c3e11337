//! Shared fixtures: an in-memory storage endpoint and a scripted transfer helper.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use mfr_tools_mfr::backup::{BackupFile, BackupSet};
use mfr_tools_mfr::endpoint::{EndpointError, EndpointKind, StorageEndpoint, ERR_NO_STREAMS};

pub const BACKUP_DIR: &str = "/backup/db";
pub const DATE: &str = "20130301";
pub const TIME: &str = "120000";

#[derive(Debug)]
pub struct FakeEndpoint {
    kind: EndpointKind,
    pub outbound: usize,
    pub inbound: usize,
    pub in_use: AtomicUsize,
    listings: Mutex<HashMap<String, Vec<String>>>,
    failing_deletes: Mutex<HashSet<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub verified: AtomicBool,
}

impl FakeEndpoint {
    pub fn new(kind: EndpointKind, outbound: usize, inbound: usize) -> Self {
        Self {
            kind,
            outbound,
            inbound,
            in_use: AtomicUsize::new(0),
            listings: Default::default(),
            failing_deletes: Default::default(),
            deleted: Default::default(),
            verified: AtomicBool::new(false),
        }
    }

    pub fn with_listing(self, path: &str, lines: &[&str]) -> Self {
        self.listings.lock().unwrap().insert(
            path.to_string(),
            lines.iter().map(|line| line.to_string()).collect(),
        );
        self
    }

    /// Lists `set` under the default backup directory, as the helper would.
    pub fn with_set(self, set: &BackupSet) -> Self {
        let dir_line = format!("{}\t755", set.date());
        let file_lines: Vec<String> = set
            .files()
            .iter()
            .map(|file| format!("{}\t{}\t{}", file.name, file.mode, file.size))
            .collect();
        {
            let mut listings = self.listings.lock().unwrap();
            let dirs = listings.entry(BACKUP_DIR.to_string()).or_default();
            if !dirs.contains(&dir_line) {
                dirs.push(dir_line);
            }
            listings
                .entry(format!("{}/{}", BACKUP_DIR, set.date()))
                .or_default()
                .extend(file_lines);
        }
        self
    }

    pub fn failing_delete(self, path: &str) -> Self {
        self.failing_deletes
            .lock()
            .unwrap()
            .insert(path.to_string());
        self
    }

    pub fn deleted(&self) -> Vec<String> {
        let mut deleted = self.deleted.lock().unwrap().clone();
        deleted.sort();
        deleted
    }
}

#[async_trait::async_trait]
impl StorageEndpoint for FakeEndpoint {
    fn kind(&self) -> EndpointKind {
        self.kind
    }

    fn hostname(&self) -> &str {
        match self.kind {
            EndpointKind::Local => "dd-local",
            EndpointKind::Remote => "dd-remote",
        }
    }

    fn backup_dir(&self) -> &str {
        BACKUP_DIR
    }

    fn storage_unit(&self) -> &str {
        "GPDB"
    }

    async fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>, EndpointError> {
        Ok(self.listings.lock().unwrap().get(path).cloned())
    }

    async fn delete_file(&self, path: &str) -> Result<(), EndpointError> {
        if self.failing_deletes.lock().unwrap().contains(path) {
            return Err(EndpointError::Vendor {
                code: ERR_NO_STREAMS,
            });
        }
        self.deleted.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn outbound_ceiling(&self) -> Result<usize, EndpointError> {
        Ok(self.outbound)
    }

    async fn inbound_ceiling(&self) -> Result<usize, EndpointError> {
        Ok(self.inbound)
    }

    async fn in_use_streams(&self) -> Result<usize, EndpointError> {
        Ok(self.in_use.load(Ordering::SeqCst))
    }

    async fn probe_reachable(&self) -> Result<bool, EndpointError> {
        Ok(true)
    }

    async fn verify_credentials(&self) -> Result<(), EndpointError> {
        self.verified.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// What the scripted helper does for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reports half the bytes, then all of them
    Ok,
    /// Fails with a vendor error code
    Fail,
    /// Reports no progress until interrupted, then acknowledges the cancel
    Hang,
    /// Ignores interrupts and never exits on its own
    Stubborn,
}

impl Behavior {
    fn as_str(&self) -> &'static str {
        match self {
            Behavior::Ok => "ok",
            Behavior::Fail => "fail",
            Behavior::Hang => "hang",
            Behavior::Stubborn => "stubborn",
        }
    }
}

const HELPER_SCRIPT: &str = r#"#!/bin/bash
dir="$(dirname "$0")"
path="$3"
name="${path##*/}"
size="$(cat "$dir/$name.size")"
behavior="$(cat "$dir/$name.behavior")"
echo "$name" >> "$dir/started"
touch "$dir/running.$$"
ls "$dir"/running.* | wc -l >> "$dir/concurrency"
trap 'rm -f "$dir/running.$$"; echo "File copy on ddboost canceled for $name"; exit 1' INT
case "$behavior" in
    ok)
        sleep 0.2
        echo "Replication of $path completed 50 percent, $((size / 2)) bytes"
        sleep 0.2
        rm -f "$dir/running.$$"
        echo "Replication of $path completed 100 percent, $size bytes"
        ;;
    fail)
        sleep 0.1
        rm -f "$dir/running.$$"
        echo "ddboost copy of $name failed, err: 5005" >&2
        exit 1
        ;;
    hang)
        echo "Replication of $path completed 0 percent, 0 bytes"
        while true; do sleep 0.1; done
        ;;
    stubborn)
        trap '' INT
        while true; do sleep 0.1; done
        ;;
esac
"#;

/// A helper program in its own directory, with the behavior for each file.
pub struct Helper {
    pub dir: tempfile::TempDir,
}

impl Helper {
    pub fn new(files: &[(BackupFile, Behavior)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("helper.sh");
        std::fs::write(&script, HELPER_SCRIPT).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        for (file, behavior) in files {
            std::fs::write(
                dir.path().join(format!("{}.size", file.name)),
                file.size.to_string(),
            )
            .unwrap();
            std::fs::write(
                dir.path().join(format!("{}.behavior", file.name)),
                behavior.as_str(),
            )
            .unwrap();
        }
        Self { dir }
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("helper.sh")
    }

    /// Names of the files a helper was started for.
    pub fn started(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("started"))
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Most helpers seen running at once.
    pub fn max_concurrency(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("concurrency"))
            .map(|text| {
                text.lines()
                    .filter_map(|line| line.trim().parse().ok())
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn settings(&self) -> mfr_tools_mfr::Settings {
        mfr_tools_mfr::Settings {
            helper: self.path(),
            poll_interval: std::time::Duration::from_millis(20),
            watchdog: std::time::Duration::from_secs(5),
            delete_batch_size: 2,
            progress: common::ProgressMode::Off,
        }
    }
}

pub fn file(index: usize, size: u64) -> BackupFile {
    BackupFile::new(format!("gp_dump_0_{index}_{DATE}{TIME}.gz"), "644", size)
}

pub fn backup_set(files: &[(BackupFile, Behavior)]) -> BackupSet {
    BackupSet::with_files(DATE, TIME, files.iter().map(|(f, _)| f.clone()).collect()).unwrap()
}

/// Destination path of `file` in the test backup set.
pub fn dest_path(file: &BackupFile) -> String {
    format!("{}/{}/{}", BACKUP_DIR, DATE, file.name)
}
