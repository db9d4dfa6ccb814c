//! Crash-safe, file-locked collection of tracked overrides

use crate::{
    error::{Error, Result},
    services::{
        interval::{Interval, IntervalOptions},
        schedule::{ScheduleCodec, ScheduleState},
    },
    time_control_client::TimeControl,
};
use chrono::{DateTime, TimeDelta};
use chrono_tz::Tz;
use log::{debug, info, warn};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Deserializer, Serialize, de};
use std::{
    ffi::OsString,
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Exclusive lock on `<store file>.lock`, released on drop
pub struct StoreLock {
    _lock: Flock<File>,
}

impl StoreLock {
    /// Blocks until no other process holds the lock
    pub fn acquire(store_file: &Path) -> Result<Self> {
        if let Some(parent) = store_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                Error::persistence(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let path = with_suffix(store_file, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::persistence(format!("failed to open {}: {e}", path.display())))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| {
            Error::persistence(format!("failed to lock {}: {e}", path.display()))
        })?;
        debug!("locked {}", path.display());

        Ok(Self { _lock: lock })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BlockedValue {
    Bool(bool),
    Text(String),
}

/// Accepts `true`/`false` as well as the strings `"true"`/`"false"`
fn deserialize_blocked<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match BlockedValue::deserialize(deserializer)? {
        BlockedValue::Bool(blocked) => Ok(blocked),
        BlockedValue::Text(text) => match text.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(de::Error::custom(format!("invalid blocked value {other}"))),
        },
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct IntervalRecord {
    timepoint: i64,
    #[serde(deserialize_with = "deserialize_blocked")]
    blocked: bool,
    #[serde(default)]
    original_state: Option<ScheduleState>,
}

impl From<&Interval> for IntervalRecord {
    fn from(interval: &Interval) -> Self {
        Self {
            timepoint: interval.timepoint().timestamp(),
            blocked: interval.is_blocked(),
            original_state: Some(interval.original_state()),
        }
    }
}

/// Tracked overrides, persisted after every mutation
pub struct IntervalStore<'a> {
    path: PathBuf,
    intervals: Vec<Interval>,
    codec: ScheduleCodec,
    grace: TimeDelta,
    device: &'a dyn TimeControl,
    _lock: StoreLock,
}

impl<'a> IntervalStore<'a> {
    /// Read the store file, starting empty if it is missing or unreadable
    ///
    /// Records without an original state get it from the device.
    pub fn load(
        lock: StoreLock,
        path: &Path,
        codec: ScheduleCodec,
        poll_interval: Duration,
        device: &'a dyn TimeControl,
    ) -> Result<Self> {
        let grace = TimeDelta::from_std(poll_interval)
            .map_err(|e| Error::validation(format!("invalid poll interval: {e}")))?;

        let mut store = Self {
            path: path.to_path_buf(),
            intervals: Vec::new(),
            codec,
            grace,
            device,
            _lock: lock,
        };

        for record in store.read_records() {
            let timepoint = match codec.from_epoch_secs(record.timepoint) {
                Ok(timepoint) => timepoint,
                Err(e) => {
                    warn!("skipping record with timepoint {}: {e}", record.timepoint);
                    continue;
                }
            };
            if store.interval_for(&timepoint).is_some() {
                warn!("skipping duplicate record for {timepoint}");
                continue;
            }

            let interval = Interval::new(
                timepoint,
                IntervalOptions {
                    blocked: Some(record.blocked),
                    original_state: record.original_state,
                },
                codec,
                device,
            )?;
            store.intervals.push(interval);
        }

        Ok(store)
    }

    fn read_records(&self) -> Vec<IntervalRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "file {} not readable ({e}); starting with empty store",
                    self.path.display()
                );
                return Vec::new();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(
                "file {} not parsable ({e}); starting with empty store",
                self.path.display()
            );
            Vec::new()
        })
    }

    /// Atomically replace the store file with the current intervals
    pub fn store(&self) -> Result<()> {
        let records: Vec<IntervalRecord> = self.intervals.iter().map(IntervalRecord::from).collect();
        let json = serde_json::to_string(&records)
            .map_err(|e| Error::persistence(format!("failed to serialize intervals: {e}")))?;

        let tmp_path = with_suffix(&self.path, ".tmp");
        let persist = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };

        persist().map_err(|e| {
            Error::persistence(format!("failed to write {}: {e}", self.path.display()))
        })?;
        debug!("stored {} intervals in {}", records.len(), self.path.display());

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    fn interval_for(&self, timepoint: &DateTime<Tz>) -> Option<usize> {
        self.intervals
            .iter()
            .position(|interval| interval.contains(timepoint))
    }

    pub fn get_interval_for_time_point(&self, timepoint: &DateTime<Tz>) -> Option<&Interval> {
        self.interval_for(timepoint).map(|i| &self.intervals[i])
    }

    fn index_for_time_point(&mut self, timepoint: &DateTime<Tz>) -> Result<usize> {
        if let Some(index) = self.interval_for(timepoint) {
            return Ok(index);
        }

        let interval = Interval::new(
            *timepoint,
            IntervalOptions::default(),
            self.codec,
            self.device,
        )?;
        debug!("tracking new {interval}");
        self.intervals.push(interval);
        self.store()?;

        Ok(self.intervals.len() - 1)
    }

    /// Existing interval containing `timepoint`, or a new one with its
    /// original state captured from the device
    pub fn get_or_create_interval_for_time_point(
        &mut self,
        timepoint: &DateTime<Tz>,
    ) -> Result<&Interval> {
        let index = self.index_for_time_point(timepoint)?;
        Ok(&self.intervals[index])
    }

    fn block_unless_blocked(&mut self, index: usize) -> Result<()> {
        let interval = &mut self.intervals[index];
        if interval.is_blocked() {
            debug!("{interval} already blocked");
            return Ok(());
        }

        interval.block(self.device)?;
        self.store()
    }

    /// Block the slot containing `now` and, if different, the slot a poll
    /// two intervals ahead will fall into
    pub fn block_current(&mut self, now: &DateTime<Tz>) -> Result<()> {
        let current = self.index_for_time_point(now)?;
        self.block_unless_blocked(current)?;

        let ahead = *now + self.grace * 2;
        let next = self.index_for_time_point(&ahead)?;
        if next != current {
            self.block_unless_blocked(next)?;
        }

        Ok(())
    }

    pub fn revert_and_remove_expired_intervals(&mut self, now: &DateTime<Tz>) -> Result<()> {
        let grace = self.grace;
        self.revert_and_remove(|interval| interval.is_expired(now, grace))
    }

    pub fn revert_and_remove_all_intervals(&mut self) -> Result<()> {
        self.revert_and_remove(|_| true)
    }

    /// Intervals failing to revert stay tracked; the first failure is
    /// returned after the remaining ones have been processed and stored
    fn revert_and_remove(&mut self, selected: impl Fn(&Interval) -> bool) -> Result<()> {
        let mut first_error = None;

        for mut interval in std::mem::take(&mut self.intervals) {
            if !selected(&interval) {
                self.intervals.push(interval);
                continue;
            }

            info!("{interval} selected for revert");
            if let Err(e) = interval.revert(self.device) {
                warn!("failed to revert {interval}: {e}");
                self.intervals.push(interval);
                first_error.get_or_insert(e);
            }
        }

        self.store()?;
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Display for IntervalStore<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let intervals: Vec<String> = self.intervals.iter().map(Interval::to_string).collect();
        write!(f, "{}", intervals.join(","))
    }
}
