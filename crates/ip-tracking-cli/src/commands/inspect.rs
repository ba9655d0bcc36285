//! Flag and request log inspection commands.

use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use ip_tracking::{FlagStore, RecordFilter, RequestLog};

use crate::cli::RequestsArgs;
use crate::error::CliError;
use crate::output::{FlagList, OutputFormat, RequestList};

/// Inspection command executor.
pub struct InspectCommand {
    log: Arc<dyn RequestLog>,
    flags: Arc<dyn FlagStore>,
}

impl InspectCommand {
    /// Create a new inspection command.
    #[must_use]
    pub fn new(log: Arc<dyn RequestLog>, flags: Arc<dyn FlagStore>) -> Self {
        Self { log, flags }
    }

    /// List flags, optionally for one address.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag store cannot be read or output fails.
    pub async fn flags<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        address: Option<IpAddr>,
    ) -> Result<(), CliError> {
        let flags = self.flags.find_flags(address).await?;
        format.write(writer, &FlagList { flags })
    }

    /// Show recent requests, newest last.
    ///
    /// # Errors
    ///
    /// Returns an error if the request log cannot be read or output fails.
    pub async fn requests<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &RequestsArgs,
    ) -> Result<(), CliError> {
        let mut filter =
            RecordFilter::new().since(Utc::now() - Duration::minutes(i64::from(args.since_minutes)));
        if let Some(address) = args.address {
            filter = filter.address(address);
        }

        let mut records = self.log.find_records(&filter).await?;
        let total = records.len();
        if total > args.limit {
            records.drain(..total - args.limit);
        }

        format.write(writer, &RequestList { records, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Format;
    use ip_tracking::{FileStore, FlaggedAddress, RequestRecord};
    use tempfile::TempDir;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("valid address")
    }

    fn setup() -> (TempDir, Arc<FileStore>, InspectCommand) {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(FileStore::open(dir.path()).expect("open store"));
        let cmd = InspectCommand::new(store.clone(), store.clone());
        (dir, store, cmd)
    }

    fn args(address: Option<IpAddr>, limit: usize) -> RequestsArgs {
        RequestsArgs {
            address,
            since_minutes: 60,
            limit,
        }
    }

    #[tokio::test]
    async fn requests_filters_window_and_address() {
        let (_dir, store, cmd) = setup();
        let now = Utc::now();
        for (addr, minutes_ago) in [("10.0.0.1", 5), ("10.0.0.1", 120), ("10.0.0.2", 5)] {
            let record = RequestRecord::new(ip(addr), "/", now - Duration::minutes(minutes_ago))
                .expect("record");
            store.create_record(record).await.expect("write");
        }

        let mut out = Vec::new();
        cmd.requests(&mut out, &OutputFormat::new(Format::Json), &args(Some(ip("10.0.0.1")), 50))
            .await
            .expect("requests succeeds");
        let parsed: serde_json::Value = serde_json::from_slice(&out).expect("valid json");

        assert_eq!(parsed["total"], 1);
        assert_eq!(parsed["records"][0]["address"], "10.0.0.1");
    }

    #[tokio::test]
    async fn requests_keeps_most_recent_within_limit() {
        let (_dir, store, cmd) = setup();
        let now = Utc::now();
        for (i, path) in ["/a", "/b", "/c"].into_iter().enumerate() {
            let at = now - Duration::minutes(10 - i as i64);
            let record = RequestRecord::new(ip("10.0.0.1"), path, at).expect("record");
            store.create_record(record).await.expect("write");
        }

        let mut out = Vec::new();
        cmd.requests(&mut out, &OutputFormat::new(Format::Json), &args(None, 2))
            .await
            .expect("requests succeeds");
        let parsed: serde_json::Value = serde_json::from_slice(&out).expect("valid json");

        assert_eq!(parsed["total"], 3);
        assert_eq!(parsed["records"][0]["path"], "/b");
        assert_eq!(parsed["records"][1]["path"], "/c");
    }

    #[tokio::test]
    async fn flags_for_address() {
        let (_dir, store, cmd) = setup();
        for addr in ["10.0.0.1", "10.0.0.2"] {
            let flag = FlaggedAddress::new(ip(addr), "exceeded rate threshold", Utc::now());
            store.create_flag_if_absent(flag).await.expect("write");
        }

        let mut out = Vec::new();
        cmd.flags(&mut out, &OutputFormat::default(), Some(ip("10.0.0.2")))
            .await
            .expect("flags succeeds");
        let output = String::from_utf8(out).expect("utf8");

        assert!(output.contains("10.0.0.2"));
        assert!(!output.contains("10.0.0.1"));
        assert!(output.contains("Total: 1 flag(s)"));
    }

    #[tokio::test]
    async fn flags_empty() {
        let (_dir, _store, cmd) = setup();

        let mut out = Vec::new();
        cmd.flags(&mut out, &OutputFormat::default(), None)
            .await
            .expect("flags succeeds");

        assert!(String::from_utf8(out).expect("utf8").contains("No flagged addresses"));
    }
}
