//! Telemetry channel naming.
//!
//! A job's channel is derived from its id alone (`job_logs:<id>`), so any
//! component that knows the id can address the channel without a lookup.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::JobId;

/// Prefix shared by every job telemetry channel.
pub const CHANNEL_PREFIX: &str = "job_logs:";

/// Name of a per-job telemetry channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// The canonical channel for a job.
    pub fn for_job(job_id: JobId) -> Self {
        Self(format!("{CHANNEL_PREFIX}{job_id}"))
    }

    /// Wrap a stored channel name without validating it.
    ///
    /// Stored names written by older rows may not follow the convention;
    /// [`ChannelName::job_id`] returns `None` for those.
    pub fn from_stored(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the job id encoded in the channel name, if any.
    pub fn job_id(&self) -> Option<JobId> {
        self.0
            .strip_prefix(CHANNEL_PREFIX)
            .and_then(|id| id.parse().ok())
    }

    /// Whether this name is the canonical channel for `job_id`.
    pub fn is_for(&self, job_id: JobId) -> bool {
        self.job_id() == Some(job_id)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
