//! Session snapshot schema and the file store
//!
//! One zstd-compressed JSON document per session. Saves go through a temp
//! file that is fsynced and renamed into place; the file it replaces is kept
//! as `.prev` so a crash between the two renames, or a corrupt primary,
//! still leaves a readable snapshot.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::trading_core::attempts::AttemptRecord;
use crate::trading_core::bars::BarSeq;
use crate::trading_core::breakout::BreakoutState;
use crate::trading_core::levels::PivotKey;
use crate::trading_core::position::{DailyPnL, Position};

pub const SNAPSHOT_VERSION: u32 = 1;

const FILE_NAME: &str = "session.json.zst";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {} is unreadable: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },
    #[error("snapshot encode failed: {0}")]
    Encode(String),
    #[error("snapshot version {found} not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("snapshot is for {found}, session is {expected}")]
    Stale { found: NaiveDate, expected: NaiveDate },
    #[error("snapshot write timed out")]
    Timeout,
    #[error("snapshot task failed: {0}")]
    Task(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Per-instrument strategy state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub symbol: String,
    pub pivot: PivotKey,
    /// Absolute index the next closed bar will receive
    pub next_seq: BarSeq,
    pub state: BreakoutState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub session_date: NaiveDate,
    pub saved_at: DateTime<Utc>,
    pub instruments: Vec<InstrumentSnapshot>,
    pub positions: Vec<Position>,
    pub attempts: Vec<AttemptRecord>,
    pub daily: DailyPnL,
}

impl SessionSnapshot {
    /// Empty snapshot for a fresh session
    pub fn empty(session_date: NaiveDate, saved_at: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            session_date,
            saved_at,
            instruments: Vec::new(),
            positions: Vec::new(),
            attempts: Vec::new(),
            daily: DailyPnL::new(session_date),
        }
    }

    fn validate(&self, session_date: NaiveDate) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        if self.session_date != session_date {
            return Err(SnapshotError::Stale {
                found: self.session_date,
                expected: session_date,
            });
        }
        Ok(())
    }
}

/// Snapshot files under one directory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn primary_path(&self) -> PathBuf {
        self.dir.join(FILE_NAME)
    }

    pub fn previous_path(&self) -> PathBuf {
        self.dir.join(format!("{FILE_NAME}.prev"))
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("{FILE_NAME}.tmp"))
    }

    /// Write-and-replace; the previous primary becomes `.prev`
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SnapshotError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let json = serde_json::to_vec(snapshot).map_err(|e| SnapshotError::Encode(e.to_string()))?;
        let compressed = zstd::encode_all(&json[..], 3).map_err(|e| SnapshotError::Encode(e.to_string()))?;

        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
            file.write_all(&compressed).map_err(io_err(&tmp))?;
            file.sync_all().map_err(io_err(&tmp))?;
        }

        let primary = self.primary_path();
        if primary.exists() {
            let previous = self.previous_path();
            fs::rename(&primary, &previous).map_err(io_err(&previous))?;
        }
        fs::rename(&tmp, &primary).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            SnapshotError::Io {
                path: primary.clone(),
                source,
            }
        })?;

        debug!(
            "Snapshot saved: {} positions, {} instruments, {} bytes",
            snapshot.positions.len(),
            snapshot.instruments.len(),
            compressed.len()
        );
        Ok(())
    }

    /// Read and validate one file
    pub fn load(&self, path: &Path, session_date: NaiveDate) -> Result<SessionSnapshot, SnapshotError> {
        let compressed = fs::read(path).map_err(io_err(path))?;
        let json = zstd::decode_all(&compressed[..]).map_err(|e| SnapshotError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&json).map_err(|e| SnapshotError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        snapshot.validate(session_date)?;
        Ok(snapshot)
    }

    /// Most recent valid snapshot for `session_date`: the primary, else `.prev`.
    /// Unreadable or stale files are logged and skipped, never fatal.
    pub fn load_latest(&self, session_date: NaiveDate) -> Option<SessionSnapshot> {
        for path in [self.primary_path(), self.previous_path()] {
            if !path.exists() {
                continue;
            }
            match self.load(&path, session_date) {
                Ok(snapshot) => {
                    info!(
                        "Loaded snapshot {} saved at {} ({} positions)",
                        path.display(),
                        snapshot.saved_at,
                        snapshot.positions.len()
                    );
                    return Some(snapshot);
                }
                Err(SnapshotError::Stale { found, expected }) => {
                    info!(
                        "Ignoring snapshot {} from {} (session {})",
                        path.display(),
                        found,
                        expected
                    );
                }
                Err(e) => warn!("Skipping snapshot: {}", e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::levels::Direction;
    use chrono::TimeZone;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()
    }

    fn snapshot(realized: f64) -> SessionSnapshot {
        let mut snap = SessionSnapshot::empty(date(), Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap());
        snap.daily.realized_pnl = realized;
        snap.attempts.push(AttemptRecord {
            key: PivotKey {
                symbol: "AAPL".to_string(),
                pivot_cents: 5000,
                direction: Direction::Long,
            },
            entries: 1,
        });
        snap.instruments.push(InstrumentSnapshot {
            symbol: "AAPL".to_string(),
            pivot: snap.attempts[0].key.clone(),
            next_seq: BarSeq(620),
            state: BreakoutState::Idle { armed: false },
        });
        snap
    }

    #[test]
    fn test_save_then_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&snapshot(12.5)).unwrap();

        let loaded = store.load_latest(date()).unwrap();
        assert_eq!(loaded, snapshot(12.5));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_second_save_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&snapshot(1.0)).unwrap();
        store.save(&snapshot(2.0)).unwrap();

        assert_eq!(store.load_latest(date()).unwrap().daily.realized_pnl, 2.0);
        let prev = store.load(&store.previous_path(), date()).unwrap();
        assert_eq!(prev.daily.realized_pnl, 1.0);
    }

    #[test]
    fn test_corrupt_primary_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&snapshot(1.0)).unwrap();
        store.save(&snapshot(2.0)).unwrap();
        fs::write(store.primary_path(), b"not zstd at all").unwrap();

        assert_eq!(store.load_latest(date()).unwrap().daily.realized_pnl, 1.0);
    }

    #[test]
    fn test_crash_between_renames_reads_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&snapshot(1.0)).unwrap();
        fs::rename(store.primary_path(), store.previous_path()).unwrap();
        fs::write(store.temp_path(), b"half written").unwrap();

        assert_eq!(store.load_latest(date()).unwrap().daily.realized_pnl, 1.0);
    }

    #[test]
    fn test_stale_date_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&snapshot(1.0)).unwrap();

        let next_day = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        assert!(store.load_latest(next_day).is_none());
        assert!(matches!(
            store.load(&store.primary_path(), next_day),
            Err(SnapshotError::Stale { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut snap = snapshot(1.0);
        snap.version = SNAPSHOT_VERSION + 1;
        store.save(&snap).unwrap();

        assert!(matches!(
            store.load(&store.primary_path(), date()),
            Err(SnapshotError::Version { .. })
        ));
        assert!(store.load_latest(date()).is_none());
    }

    #[test]
    fn test_missing_directory_is_clean_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("never-created"));
        assert!(store.load_latest(date()).is_none());
    }
}
