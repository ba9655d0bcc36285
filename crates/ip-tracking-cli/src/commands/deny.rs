//! Deny-list administration commands.

use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;

use ip_tracking::{DenyList, admin};

use crate::error::CliError;
use crate::output::{BlockedList, OutputFormat, UnblockOutcome};

/// Deny-list command executor.
pub struct DenyCommand {
    deny_list: Arc<dyn DenyList>,
}

impl DenyCommand {
    /// Create a new deny-list command.
    #[must_use]
    pub fn new(deny_list: Arc<dyn DenyList>) -> Self {
        Self { deny_list }
    }

    /// Block an address.
    ///
    /// # Errors
    ///
    /// Returns an error if the deny-list cannot be written or output fails.
    pub async fn block<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        address: IpAddr,
    ) -> Result<(), CliError> {
        let outcome = admin::block(self.deny_list.as_ref(), address).await?;
        format.write(writer, &outcome)
    }

    /// Unblock an address.
    ///
    /// # Errors
    ///
    /// Returns an error if the deny-list cannot be written or output fails.
    pub async fn unblock<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        address: IpAddr,
    ) -> Result<(), CliError> {
        let removed = admin::unblock(self.deny_list.as_ref(), address).await?;
        format.write(writer, &UnblockOutcome { address, removed })
    }

    /// List blocked addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if the deny-list cannot be read or output fails.
    pub async fn list<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let entries = admin::blocked(self.deny_list.as_ref()).await?;
        format.write(writer, &BlockedList { entries })
    }
}
