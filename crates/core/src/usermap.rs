//! AccuRev username to Git identity mapping.
//!
//! Mappings come from the `[[usermap]]` tables of the config file. Lookup
//! never fails: an unmapped username falls back to a synthesized identity
//! (`{username}@accurev.localhost`, UTC timestamps) so a conversion is not
//! interrupted by one missing entry. The `users` subcommand reports the
//! gaps up front.

use std::collections::HashMap;

use regex_lite::Regex;
use tracing::debug;

use crate::config::UserMapEntry;
use crate::errors::UserMapError;

/// A Git author/committer identity plus the timezone commits are rendered in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Fixed UTC offset in minutes, as git stores it.
    pub offset_minutes: i32,
}

/// Username lookup table built once at engine start.
pub struct UserMap {
    entries: HashMap<String, UserIdentity>,
}

impl UserMap {
    /// Build the table from config entries. Timezones are parsed here so a
    /// bad entry fails the run before any conversion work starts.
    pub fn from_entries(entries: &[UserMapEntry]) -> Result<Self, UserMapError> {
        let mut map = HashMap::new();
        for entry in entries {
            if entry.git_name.trim().is_empty() || entry.git_email.trim().is_empty() {
                return Err(UserMapError::IncompleteMapping {
                    user: entry.accurev_username.clone(),
                    detail: "git_name and git_email are required".to_string(),
                });
            }
            let offset_minutes = match &entry.timezone {
                Some(spec) => parse_fixed_offset(spec).ok_or_else(|| {
                    UserMapError::InvalidTimezone {
                        user: entry.accurev_username.clone(),
                        spec: spec.clone(),
                    }
                })?,
                None => 0,
            };
            map.insert(
                entry.accurev_username.clone(),
                UserIdentity {
                    name: entry.git_name.clone(),
                    email: entry.git_email.clone(),
                    offset_minutes,
                },
            );
        }
        Ok(Self { entries: map })
    }

    /// Resolve a username to a Git identity, synthesizing one when unmapped.
    pub fn resolve(&self, accurev_username: &str) -> UserIdentity {
        if let Some(identity) = self.entries.get(accurev_username) {
            return identity.clone();
        }
        debug!(accurev_username, "no usermap entry, synthesizing identity");
        UserIdentity {
            name: accurev_username.to_string(),
            email: format!("{}@accurev.localhost", accurev_username),
            offset_minutes: 0,
        }
    }

    pub fn is_mapped(&self, accurev_username: &str) -> bool {
        self.entries.contains_key(accurev_username)
    }

    /// Usernames with no mapping, sorted and deduplicated.
    pub fn unmapped<'a>(&self, usernames: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut missing: Vec<String> = usernames
            .into_iter()
            .filter(|name| !self.is_mapped(name))
            .map(|name| name.to_string())
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

/// Parse a git-style fixed offset (`+0100`, `-0530`) into minutes.
pub fn parse_fixed_offset(spec: &str) -> Option<i32> {
    let pattern = Regex::new(r"^[+-][0-9]{4}$").ok()?;
    if !pattern.is_match(spec) {
        return None;
    }
    let sign = if spec.starts_with('-') { -1 } else { 1 };
    let hours: i32 = spec[1..3].parse().ok()?;
    let minutes: i32 = spec[3..5].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    Some(sign * (hours * 60 + minutes))
}
