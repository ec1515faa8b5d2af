//! Job submission engine: everything the HTTP layer does to jobs goes
//! through [`JobSubmitter`].

pub mod submitter;

pub use submitter::JobSubmitter;
