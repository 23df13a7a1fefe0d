// Invariant Framework
//
// Invariants are pure rules that a commit's actions must satisfy against
// the state they were built on. Violations are detected *before* the
// commit is submitted.

use std::collections::HashSet;

use crate::log::{Action, Version};
use crate::state::TableState;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait CommitInvariant: Send + Sync {
    fn name(&self) -> &'static str;

    /// `read_state` is `None` when `version` creates the table.
    fn validate(
        &self,
        read_state: Option<&TableState>,
        version: Version,
        actions: &[Action],
    ) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn CommitInvariant>>,
}

impl std::fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.invariants.iter().map(|i| i.name()))
            .finish()
    }
}

impl InvariantEngine {
    /// Create a new invariant engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with the built-in invariants every writer should enforce.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(TableDefinition);
        engine.register(SingleMetadata);
        engine.register(KnownRemoves);
        engine
    }

    /// Register an invariant.
    pub fn register<I: CommitInvariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        read_state: Option<&TableState>,
        version: Version,
        actions: &[Action],
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(read_state, version, actions) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        version,
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant `{invariant}` violated at version {version}: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub version: Version,
    pub reason: String,
}

/// The commit creating a table carries its protocol and metadata.
pub struct TableDefinition;

impl CommitInvariant for TableDefinition {
    fn name(&self) -> &'static str {
        "table-definition"
    }

    fn validate(&self, read_state: Option<&TableState>, _: Version, actions: &[Action]) -> InvariantResult {
        if read_state.is_some() {
            return InvariantResult::Pass;
        }
        let protocol = actions.iter().any(|a| matches!(a, Action::Protocol(_)));
        let metadata = actions.iter().any(|a| matches!(a, Action::Metadata(_)));
        if protocol && metadata {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail("first commit must define protocol and metadata".into())
        }
    }
}

/// At most one metadata and one protocol action per commit.
pub struct SingleMetadata;

impl CommitInvariant for SingleMetadata {
    fn name(&self) -> &'static str {
        "single-metadata"
    }

    fn validate(&self, _: Option<&TableState>, _: Version, actions: &[Action]) -> InvariantResult {
        let metadata = actions.iter().filter(|a| matches!(a, Action::Metadata(_))).count();
        let protocol = actions.iter().filter(|a| matches!(a, Action::Protocol(_))).count();
        if metadata > 1 || protocol > 1 {
            InvariantResult::Fail(format!(
                "found {metadata} metadata and {protocol} protocol actions"
            ))
        } else {
            InvariantResult::Pass
        }
    }
}

/// A remove names a file that is live, or added earlier in the same commit.
pub struct KnownRemoves;

impl CommitInvariant for KnownRemoves {
    fn name(&self) -> &'static str {
        "known-removes"
    }

    fn validate(&self, read_state: Option<&TableState>, _: Version, actions: &[Action]) -> InvariantResult {
        let mut added = HashSet::new();
        for action in actions {
            match action {
                Action::Add(add) => {
                    added.insert(add.path.as_str());
                }
                Action::Remove(remove) => {
                    let live = read_state.is_some_and(|s| s.contains_file(&remove.path));
                    if !live && !added.contains(remove.path.as_str()) {
                        return InvariantResult::Fail(format!(
                            "remove of unknown file {}",
                            remove.path
                        ));
                    }
                }
                _ => {}
            }
        }
        InvariantResult::Pass
    }
}
