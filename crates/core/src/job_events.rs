//! Human-readable telemetry lines with fixed wording.
//!
//! Clients match on some of these (e.g. to stop a spinner), so the text is
//! kept in one place.

/// Published by the submitter when a user cancels a job.
pub const LINE_CANCELLED_BY_USER: &str = "Job cancelled by user";

/// Published by a progress hook that observed the cooperative stop flag.
pub const LINE_TRAINING_CANCELLED: &str = "Training cancelled by user";

/// Published by the executor after the routine unwound due to cancellation.
pub const LINE_TRAINING_STOPPED: &str = "Training stopped (cancelled)";

/// Published when cancellation was observed before the routine started.
pub const LINE_CANCELLED_BEFORE_START: &str = "Training cancelled by user before start";

/// Prefix for the error trace line written before a job is marked failed.
pub const ERROR_LINE_PREFIX: &str = "ERROR: ";
