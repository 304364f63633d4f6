//! Account subsystem collaborator contract.
//!
//! Accounts are owned externally; the engine only needs to select one,
//! check its login, and read its traffic quota. An account-bound job uses
//! a fixed network identity and is therefore never eligible for
//! reconnection, gets the unlimited chunk override and may resume
//! transfers.

use std::collections::HashMap;

/// Remaining traffic quota for an account.
///
/// Replaces the sentinel encoding of the original subsystem (`None` for
/// unknown, `-1` for unlimited) with an explicit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficLeft {
    /// The provider did not report a quota.
    Unknown,
    /// No quota applies.
    Unlimited,
    /// Remaining quota in KiB.
    KiB(u64),
}

impl TrafficLeft {
    /// True when a file of `size_bytes` fits in the remaining quota.
    ///
    /// Unknown quotas are treated as exhausted, matching the conservative
    /// behavior of the original check.
    #[must_use]
    pub fn allows(&self, size_bytes: u64) -> bool {
        match self {
            Self::Unknown => false,
            Self::Unlimited => true,
            Self::KiB(left) => size_bytes / 1024 <= *left,
        }
    }
}

/// Account details returned by [`AccountBroker::account_info`].
#[derive(Debug, Clone)]
pub struct AccountInfo {
    /// Remaining traffic quota.
    pub traffic_left: TrafficLeft,
}

/// External account subsystem contract.
pub trait AccountBroker: Send + Sync {
    /// True when a usable account is available for this source.
    fn can_use(&self) -> bool;

    /// Selects an account, returning the user id and its credential map.
    fn select(&self) -> (String, HashMap<String, String>);

    /// True when the selected user holds a premium subscription.
    fn is_premium(&self, user: &str) -> bool;

    /// Validates the session for `user`, re-authenticating if needed.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message when the login cannot be
    /// established; the engine escalates it to a terminal failure.
    fn check_login(&self, user: &str) -> Result<(), String>;

    /// Fetches account details, optionally refreshing cached data.
    fn account_info(&self, user: &str, refresh: bool) -> AccountInfo;
}

/// Null broker for sources without account support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccounts;

impl AccountBroker for NoAccounts {
    fn can_use(&self) -> bool {
        false
    }

    fn select(&self) -> (String, HashMap<String, String>) {
        (String::new(), HashMap::new())
    }

    fn is_premium(&self, _user: &str) -> bool {
        false
    }

    fn check_login(&self, _user: &str) -> Result<(), String> {
        Ok(())
    }

    fn account_info(&self, _user: &str, _refresh: bool) -> AccountInfo {
        AccountInfo {
            traffic_left: TrafficLeft::Unknown,
        }
    }
}
