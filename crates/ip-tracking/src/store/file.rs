//! File-based store.
//!
//! Each repository is a JSON-lines file in a base directory:
//!
//! - `requests.jsonl`: one [`RequestRecord`] per line, appended
//! - `denied.jsonl`: one [`DeniedAddress`] per line; rewritten on removal
//! - `flagged.jsonl`: one [`FlaggedAddress`] per line, appended
//!
//! Every operation reads the file afresh, so several processes (a server
//! writing records, the CLI blocking addresses, a scheduled scanner) see each
//! other's writes. Writes within one process are serialized; create-if-absent
//! across processes is not atomic.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    DeniedAddress, DenyList, FlagStore, FlaggedAddress, RecordFilter, RequestLog, RequestRecord,
    StoreFuture,
};
use crate::error::TrackingResult;

const REQUESTS_FILE: &str = "requests.jsonl";
const DENIED_FILE: &str = "denied.jsonl";
const FLAGGED_FILE: &str = "flagged.jsonl";

/// JSON-lines store rooted at a directory.
#[derive(Debug)]
pub struct FileStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store in `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(base_dir: impl Into<PathBuf>) -> TrackingResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        debug!(dir = %base_dir.display(), "Opened file store");
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// The directory holding the store files.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    fn read_lines<T: DeserializeOwned>(&self, name: &str) -> TrackingResult<Vec<T>> {
        let path = self.path(name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(file = %path.display(), line = idx + 1, error = %e, "Skipping malformed line");
                }
            }
        }
        Ok(items)
    }

    fn append_line<T: Serialize>(&self, name: &str, item: &T) -> TrackingResult<()> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name))?;
        file.write_all(&line)?;
        Ok(())
    }

    fn rewrite<T: Serialize>(&self, name: &str, items: &[T]) -> TrackingResult<()> {
        let tmp = self.path(&format!("{name}.tmp"));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for item in items {
                serde_json::to_writer(&mut writer, item)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, self.path(name))?;
        Ok(())
    }

    fn deny(&self, ip: IpAddr) -> TrackingResult<bool> {
        let _guard = self.write_lock.lock();
        let denied: Vec<DeniedAddress> = self.read_lines(DENIED_FILE)?;
        if denied.iter().any(|d| d.address == ip) {
            return Ok(false);
        }
        self.append_line(
            DENIED_FILE,
            &DeniedAddress {
                address: ip,
                created_at: Utc::now(),
            },
        )?;
        Ok(true)
    }

    fn undeny(&self, ip: IpAddr) -> TrackingResult<bool> {
        let _guard = self.write_lock.lock();
        let mut denied: Vec<DeniedAddress> = self.read_lines(DENIED_FILE)?;
        let before = denied.len();
        denied.retain(|d| d.address != ip);
        if denied.len() == before {
            return Ok(false);
        }
        self.rewrite(DENIED_FILE, &denied)?;
        Ok(true)
    }

    fn insert_flag(&self, flag: &FlaggedAddress) -> TrackingResult<bool> {
        let _guard = self.write_lock.lock();
        let flags: Vec<FlaggedAddress> = self.read_lines(FLAGGED_FILE)?;
        if flags.iter().any(|f| f.key() == flag.key()) {
            return Ok(false);
        }
        self.append_line(FLAGGED_FILE, flag)?;
        Ok(true)
    }
}

impl RequestLog for FileStore {
    fn create_record(&self, record: RequestRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock();
            self.append_line(REQUESTS_FILE, &record)
        })
    }

    fn find_records<'a>(&'a self, filter: &'a RecordFilter) -> StoreFuture<'a, Vec<RequestRecord>> {
        Box::pin(async move {
            let mut records: Vec<RequestRecord> = self.read_lines(REQUESTS_FILE)?;
            records.retain(|r| filter.matches(r));
            records.sort_by_key(|r| r.timestamp);
            Ok(records)
        })
    }
}

impl DenyList for FileStore {
    fn contains(&self, ip: IpAddr) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let denied: Vec<DeniedAddress> = self.read_lines(DENIED_FILE)?;
            Ok(denied.iter().any(|d| d.address == ip))
        })
    }

    fn create_if_absent(&self, ip: IpAddr) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.deny(ip) })
    }

    fn remove(&self, ip: IpAddr) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.undeny(ip) })
    }

    fn list(&self) -> StoreFuture<'_, Vec<DeniedAddress>> {
        Box::pin(async move {
            let mut denied: Vec<DeniedAddress> = self.read_lines(DENIED_FILE)?;
            denied.sort_by_key(|d| d.address);
            Ok(denied)
        })
    }
}

impl FlagStore for FileStore {
    fn create_flag_if_absent(&self, flag: FlaggedAddress) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.insert_flag(&flag) })
    }

    fn find_flags(&self, address: Option<IpAddr>) -> StoreFuture<'_, Vec<FlaggedAddress>> {
        Box::pin(async move {
            let mut flags: Vec<FlaggedAddress> = self.read_lines(FLAGGED_FILE)?;
            flags.retain(|f| address.is_none_or(|a| f.address == a));
            Ok(flags)
        })
    }
}
