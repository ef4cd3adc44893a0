//! Stage definitions for the delivery pipeline.
//!
//! This module is the single source of truth for the stage order and the
//! valid-transition map. All stage changes must go through
//! [`crate::store::transitions::transition_project_stage`], which consults
//! [`can_transition`] before applying anything.
//!
//! # Stage Keys
//!
//! Each stage has a canonical string key (`0_sales` … `6_complete`) used for
//! stage-state rows, HITL gate rules, and the delivery contract. Keys
//! `7_reserved` … `12_reserved` are placeholders kept for forward
//! compatibility; they never correspond to a [`Stage`] variant.
//!
//! # Examples
//!
//! ```rust
//! use siteline::stages::{Stage, get_next_stage, can_transition};
//!
//! assert_eq!(Stage::Build.key(), "3_build");
//! assert_eq!(Stage::from_key("3_build"), Some(Stage::Build));
//!
//! // Success path
//! assert_eq!(get_next_stage(Stage::Sales, true, false), Some(Stage::Onboarding));
//! // Rework from TEST goes back to BUILD
//! assert_eq!(get_next_stage(Stage::Test, false, true), Some(Stage::Build));
//! // COMPLETE is terminal
//! assert_eq!(get_next_stage(Stage::Complete, true, false), None);
//!
//! assert!(can_transition(Some(Stage::DefectValidation), Stage::Build));
//! assert!(!can_transition(Some(Stage::Complete), Stage::Build));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven pipeline stages, in strict order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Sales,
    Onboarding,
    Assignment,
    Build,
    Test,
    DefectValidation,
    Complete,
}

/// Stage order used for iteration and readiness sweeps.
pub const STAGE_ORDER: [Stage; 7] = [
    Stage::Sales,
    Stage::Onboarding,
    Stage::Assignment,
    Stage::Build,
    Stage::Test,
    Stage::DefectValidation,
    Stage::Complete,
];

/// All stage keys, including the reserved forward-compatibility slots.
pub const STAGE_KEYS: [&str; 13] = [
    "0_sales",
    "1_onboarding",
    "2_assignment",
    "3_build",
    "4_test",
    "5_defect_validation",
    "6_complete",
    "7_reserved",
    "8_reserved",
    "9_reserved",
    "10_reserved",
    "11_reserved",
    "12_reserved",
];

impl Stage {
    /// Canonical stage key (`"0_sales"` … `"6_complete"`).
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Stage::Sales => "0_sales",
            Stage::Onboarding => "1_onboarding",
            Stage::Assignment => "2_assignment",
            Stage::Build => "3_build",
            Stage::Test => "4_test",
            Stage::DefectValidation => "5_defect_validation",
            Stage::Complete => "6_complete",
        }
    }

    /// Zero-based order index matching the key prefix.
    #[must_use]
    pub fn order(self) -> usize {
        match self {
            Stage::Sales => 0,
            Stage::Onboarding => 1,
            Stage::Assignment => 2,
            Stage::Build => 3,
            Stage::Test => 4,
            Stage::DefectValidation => 5,
            Stage::Complete => 6,
        }
    }

    /// Human-facing label for UI summaries.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Stage::Sales => "Sales",
            Stage::Onboarding => "Onboarding",
            Stage::Assignment => "Assignment",
            Stage::Build => "Build",
            Stage::Test => "Test",
            Stage::DefectValidation => "Defect Validation",
            Stage::Complete => "Complete",
        }
    }

    /// Resolve a stage from its canonical key. Reserved keys return `None`.
    pub fn from_key(key: &str) -> Option<Stage> {
        match key {
            "0_sales" => Some(Stage::Sales),
            "1_onboarding" => Some(Stage::Onboarding),
            "2_assignment" => Some(Stage::Assignment),
            "3_build" => Some(Stage::Build),
            "4_test" => Some(Stage::Test),
            "5_defect_validation" => Some(Stage::DefectValidation),
            "6_complete" => Some(Stage::Complete),
            _ => None,
        }
    }

    /// Encode for persistence (`"SALES"`, `"BUILD"`, …).
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Stage::Sales => "SALES",
            Stage::Onboarding => "ONBOARDING",
            Stage::Assignment => "ASSIGNMENT",
            Stage::Build => "BUILD",
            Stage::Test => "TEST",
            Stage::DefectValidation => "DEFECT_VALIDATION",
            Stage::Complete => "COMPLETE",
        }
    }

    /// Decode the persisted form. Unknown strings yield `None` rather than
    /// panicking; callers treat that as a validation failure.
    pub fn decode(s: &str) -> Option<Stage> {
        match s {
            "SALES" => Some(Stage::Sales),
            "ONBOARDING" => Some(Stage::Onboarding),
            "ASSIGNMENT" => Some(Stage::Assignment),
            "BUILD" => Some(Stage::Build),
            "TEST" => Some(Stage::Test),
            "DEFECT_VALIDATION" => Some(Stage::DefectValidation),
            "COMPLETE" => Some(Stage::Complete),
            _ => None,
        }
    }

    /// Stages whose work runs worker-side (an enqueued stage job) rather than
    /// as an in-process transition.
    #[must_use]
    pub fn requires_worker(self) -> bool {
        matches!(self, Stage::Build | Stage::Test | Stage::DefectValidation)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Valid next stage(s) from each stage. No branching except the rework loops
/// from TEST and DEFECT_VALIDATION back to BUILD.
#[must_use]
pub fn valid_next(from: Stage) -> &'static [Stage] {
    match from {
        Stage::Sales => &[Stage::Onboarding],
        Stage::Onboarding => &[Stage::Assignment],
        Stage::Assignment => &[Stage::Build],
        Stage::Build => &[Stage::Test],
        Stage::Test => &[Stage::DefectValidation, Stage::Build],
        Stage::DefectValidation => &[Stage::Complete, Stage::Build],
        Stage::Complete => &[],
    }
}

/// Next stage after `from`. For TEST/DEFECT_VALIDATION, `rework = true`
/// selects BUILD; otherwise the first option is the success path.
#[must_use]
pub fn get_next_stage(from: Stage, _success: bool, rework: bool) -> Option<Stage> {
    let options = valid_next(from);
    if rework && options.contains(&Stage::Build) {
        return Some(Stage::Build);
    }
    options.first().copied()
}

/// Whether `from → to` is allowed. With no `from` (fresh project), any stage
/// in the order is accepted.
#[must_use]
pub fn can_transition(from: Option<Stage>, to: Stage) -> bool {
    match from {
        None => STAGE_ORDER.contains(&to),
        Some(f) => valid_next(f).contains(&to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        for stage in STAGE_ORDER {
            assert_eq!(Stage::from_key(stage.key()), Some(stage));
            assert_eq!(Stage::decode(stage.encode()), Some(stage));
        }
        assert_eq!(Stage::from_key("7_reserved"), None);
        assert_eq!(Stage::decode("UNKNOWN"), None);
    }

    #[test]
    fn success_path_follows_order() {
        for pair in STAGE_ORDER.windows(2) {
            // TEST and DEFECT_VALIDATION still default to the success path.
            assert_eq!(get_next_stage(pair[0], true, false), Some(pair[1]));
        }
        assert_eq!(get_next_stage(Stage::Complete, true, false), None);
    }

    #[test]
    fn rework_targets_build_only_where_allowed() {
        assert_eq!(get_next_stage(Stage::Test, false, true), Some(Stage::Build));
        assert_eq!(
            get_next_stage(Stage::DefectValidation, false, true),
            Some(Stage::Build)
        );
        // Rework flag is ignored where BUILD is not a valid next stage.
        assert_eq!(
            get_next_stage(Stage::Sales, false, true),
            Some(Stage::Onboarding)
        );
    }

    #[test]
    fn transition_map_is_closed() {
        assert!(can_transition(Some(Stage::Test), Stage::Build));
        assert!(can_transition(Some(Stage::DefectValidation), Stage::Complete));
        assert!(!can_transition(Some(Stage::Build), Stage::Complete));
        assert!(!can_transition(Some(Stage::Complete), Stage::Sales));
        assert!(can_transition(None, Stage::Sales));
    }
}
