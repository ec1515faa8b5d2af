/// Job identifiers are UUIDs generated by the submitter.
pub type JobId = uuid::Uuid;

/// Project identifiers are owned by the (external) project domain.
pub type ProjectId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
