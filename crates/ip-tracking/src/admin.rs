//! Administrative deny-list operations.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use tracing::info;

use crate::error::{TrackingError, TrackingResult};
use crate::store::{DeniedAddress, DenyList};

/// Result of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockOutcome {
    /// The address.
    pub address: IpAddr,
    /// Whether a new entry was created.
    pub created: bool,
}

impl fmt::Display for BlockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.created {
            write!(f, "IP {} has been blocked.", self.address)
        } else {
            write!(f, "IP {} is already blocked.", self.address)
        }
    }
}

/// Parse an address given on the command line or an admin API.
///
/// IPv4-mapped IPv6 input is stored as the plain IPv4 address, matching
/// what [`client_address`](crate::client_address) yields for requests.
///
/// # Errors
///
/// Returns `TrackingError::InvalidAddress` if `raw` is not an IP address.
pub fn parse_address(raw: &str) -> TrackingResult<IpAddr> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_canonical())
        .map_err(|_| TrackingError::InvalidAddress(raw.to_string()))
}

/// Add an address to the deny-list. Blocking a listed address is a no-op.
///
/// # Errors
///
/// Returns an error if the deny-list cannot be written.
pub async fn block(deny_list: &dyn DenyList, ip: IpAddr) -> TrackingResult<BlockOutcome> {
    let ip = ip.to_canonical();
    let created = deny_list.create_if_absent(ip).await?;
    if created {
        info!(ip = %ip, "Address blocked");
    } else {
        info!(ip = %ip, "Address already blocked");
    }
    Ok(BlockOutcome {
        address: ip,
        created,
    })
}

/// Remove an address from the deny-list. Returns whether it was listed.
///
/// # Errors
///
/// Returns an error if the deny-list cannot be written.
pub async fn unblock(deny_list: &dyn DenyList, ip: IpAddr) -> TrackingResult<bool> {
    let ip = ip.to_canonical();
    let removed = deny_list.remove(ip).await?;
    if removed {
        info!(ip = %ip, "Address unblocked");
    }
    Ok(removed)
}

/// All deny-listed addresses.
///
/// # Errors
///
/// Returns an error if the deny-list cannot be read.
pub async fn blocked(deny_list: &dyn DenyList) -> TrackingResult<Vec<DeniedAddress>> {
    deny_list.list().await
}
