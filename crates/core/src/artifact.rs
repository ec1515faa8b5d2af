//! Durable artifact key generation.
//!
//! Keys embed a truncated job id, the upload time and a truncated
//! execution id, so two executions never produce the same key even when
//! they re-run the same job within the same second.

use uuid::Uuid;

use crate::types::{JobId, Timestamp};

/// Prefix of every trained-model artifact key.
pub const ARTIFACT_PREFIX: &str = "models/";

/// Number of hex characters kept from the job and execution ids.
const SHORT_ID_LEN: usize = 8;

/// Build the storage key for an artifact produced by one execution.
///
/// Format: `models/<job8>_<unix-secs>_<exec8>_<file-name>`.
pub fn artifact_key(job_id: JobId, execution_id: Uuid, at: Timestamp, file_name: &str) -> String {
    let job = job_id.simple().to_string();
    let exec = execution_id.simple().to_string();
    format!(
        "{ARTIFACT_PREFIX}{}_{}_{}_{}",
        &job[..SHORT_ID_LEN],
        at.timestamp(),
        &exec[..SHORT_ID_LEN],
        sanitize_file_name(file_name),
    )
}

/// Whether a string refers to a stored artifact (as opposed to a built-in
/// checkpoint name like `coco`).
pub fn is_artifact_key(value: &str) -> bool {
    value.len() > ARTIFACT_PREFIX.len() && value.starts_with(ARTIFACT_PREFIX)
}

/// Keep only the final path component and replace separators.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if base.is_empty() {
        "weights.pt".to_string()
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn key_embeds_short_ids_and_timestamp() {
        let job = Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap();
        let exec = Uuid::parse_str("fedcba9876543210fedcba9876543210").unwrap();
        let at = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let key = artifact_key(job, exec, at, "best.pt");
        assert_eq!(key, "models/01234567_1700000000_fedcba98_best.pt");
        assert!(is_artifact_key(&key));
    }

    #[test]
    fn re_running_the_same_job_yields_distinct_keys() {
        let job = Uuid::new_v4();
        let at = chrono::Utc::now();

        let first = artifact_key(job, Uuid::new_v4(), at, "best.pt");
        let second = artifact_key(job, Uuid::new_v4(), at, "best.pt");
        assert_ne!(first, second);
    }

    #[test]
    fn file_name_is_reduced_to_its_last_component() {
        let key = artifact_key(Uuid::new_v4(), Uuid::new_v4(), chrono::Utc::now(), "runs/x/best.pt");
        assert!(key.ends_with("_best.pt"));
        assert!(!key["models/".len()..].contains('/'));
    }

    #[test]
    fn builtin_checkpoints_are_not_artifacts() {
        assert!(!is_artifact_key("coco"));
        assert!(!is_artifact_key("scratch"));
        assert!(!is_artifact_key("models/"));
    }
}
