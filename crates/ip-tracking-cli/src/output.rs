//! Rendering of command results.
//!
//! Every result type renders either as an aligned table for a terminal or as
//! pretty-printed JSON for scripts, selected by `--format`.

use std::io::Write;
use std::net::IpAddr;

use ip_tracking::{BlockOutcome, DeniedAddress, FlaggedAddress, RequestRecord, ScanReport};
use serde::Serialize;

use crate::cli::Format;
use crate::error::CliError;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Selected output format.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputFormat(Format);

impl OutputFormat {
    /// Wrap the format chosen on the command line.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self(format)
    }

    /// Render `value` to `writer`.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding or the write fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        if let Format::Json = self.0 {
            serde_json::to_writer_pretty(&mut *writer, value)
                .map_err(|e| CliError::Format(format!("cannot encode JSON: {e}")))?;
            writeln!(writer)?;
            return Ok(());
        }
        value.write_table(writer)
    }
}

/// Terminal rendering of a result.
pub trait TableDisplay {
    /// Write `self` as text.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

impl TableDisplay for BlockOutcome {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{self}")?;
        Ok(())
    }
}

/// Deny-list contents.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedList {
    /// Listed addresses.
    pub entries: Vec<DeniedAddress>,
}

impl TableDisplay for BlockedList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.entries.is_empty() {
            writeln!(writer, "No blocked addresses")?;
            return Ok(());
        }

        writeln!(writer, "{:<39}  {:<19}", "ADDRESS", "BLOCKED AT")?;
        writeln!(writer, "{}", "─".repeat(60))?;
        for entry in &self.entries {
            writeln!(
                writer,
                "{:<39}  {:<19}",
                entry.address.to_string(),
                entry.created_at.format(TIME_FORMAT)
            )?;
        }

        writeln!(writer)?;
        writeln!(writer, "Total: {} address(es)", self.entries.len())?;
        Ok(())
    }
}

/// Flags raised by the scanner.
#[derive(Debug, Clone, Serialize)]
pub struct FlagList {
    /// Flags, oldest first.
    pub flags: Vec<FlaggedAddress>,
}

impl TableDisplay for FlagList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.flags.is_empty() {
            writeln!(writer, "No flagged addresses")?;
            return Ok(());
        }

        writeln!(writer, "{:<39}  {:<19}  REASON", "ADDRESS", "FLAGGED AT")?;
        writeln!(writer, "{}", "─".repeat(96))?;
        for flag in &self.flags {
            writeln!(
                writer,
                "{:<39}  {:<19}  {}",
                flag.address.to_string(),
                flag.timestamp.format(TIME_FORMAT),
                flag.reason
            )?;
        }

        writeln!(writer)?;
        writeln!(writer, "Total: {} flag(s)", self.flags.len())?;
        Ok(())
    }
}

/// Recorded requests.
#[derive(Debug, Clone, Serialize)]
pub struct RequestList {
    /// Records, oldest first.
    pub records: Vec<RequestRecord>,
    /// Records matching the query before truncation.
    pub total: usize,
}

impl TableDisplay for RequestList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.records.is_empty() {
            writeln!(writer, "No requests recorded")?;
            return Ok(());
        }

        writeln!(
            writer,
            "{:<19}  {:<39}  {:<24}  {:<16}  {:<16}",
            "TIME", "ADDRESS", "PATH", "COUNTRY", "CITY"
        )?;
        writeln!(writer, "{}", "─".repeat(122))?;
        for record in &self.records {
            writeln!(
                writer,
                "{:<19}  {:<39}  {:<24}  {:<16}  {:<16}",
                record.timestamp.format(TIME_FORMAT),
                record.address.to_string(),
                fit(&record.path, 24),
                fit(record.country.as_deref().unwrap_or("-"), 16),
                fit(record.city.as_deref().unwrap_or("-"), 16)
            )?;
        }

        writeln!(writer)?;
        if self.total > self.records.len() {
            writeln!(
                writer,
                "Showing {} of {} request(s)",
                self.records.len(),
                self.total
            )?;
        } else {
            writeln!(writer, "Total: {} request(s)", self.total)?;
        }
        Ok(())
    }
}

impl TableDisplay for ScanReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Scan Report")?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Requests examined:  {}", self.examined)?;
        writeln!(writer, "Flags created:      {}", self.created)?;
        writeln!(writer, "Already flagged:    {}", self.existing)?;
        if self.failed > 0 {
            writeln!(writer, "Failed writes:      {}", self.failed)?;
        }
        Ok(())
    }
}

/// Result of `unblock`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UnblockOutcome {
    /// The address.
    pub address: IpAddr,
    /// Whether it was on the deny-list.
    pub removed: bool,
}

impl TableDisplay for UnblockOutcome {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.removed {
            writeln!(writer, "IP {} has been unblocked.", self.address)?;
        } else {
            writeln!(writer, "IP {} is not blocked.", self.address)?;
        }
        Ok(())
    }
}

/// Printed when `watch` exits.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WatchSummary {
    /// Scans finished before the stop signal.
    pub completed_scans: u64,
}

impl TableDisplay for WatchSummary {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Scanner stopped after {} scan(s).", self.completed_scans)?;
        Ok(())
    }
}

/// Fit `s` into a column of `width` characters, marking cut text with `~`.
fn fit(s: &str, width: usize) -> String {
    match s.char_indices().nth(width) {
        None => s.to_string(),
        Some(_) => {
            let mut cut: String = s.chars().take(width.saturating_sub(1)).collect();
            cut.push('~');
            cut
        }
    }
}
