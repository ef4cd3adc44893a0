//! Template subsystem: blueprint generation, preview rendering, validation,
//! performance aggregation, and evolution proposals.
//!
//! Every pipeline here is expressed as generic jobs (see
//! [`crate::queue::generic_jobs`]); [`jobs`] registers the handlers the
//! worker runtime dispatches to. The blueprint loop is
//! generate → critique → refine with bounded iterations, aborting when a
//! refinement no longer changes the blueprint hash.

pub mod blueprint;
pub mod evolution;
pub mod jobs;
pub mod metrics;
pub mod pipeline;
pub mod preview;
pub mod rubric;
pub mod validation;
