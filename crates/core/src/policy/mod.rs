mod matcher;

pub use matcher::{
    specificity_score, validate_policy_set, MatchReason, PolicyMatch, PolicyMatcher,
    PolicySelection,
};
