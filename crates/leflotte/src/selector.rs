//! Machine selection by glob pattern

use crate::error::{FleetError, Result};
use crate::machine::Machine;
use crate::registry::Registry;
use glob::{MatchOptions, Pattern};
use indexmap::IndexSet;
use tracing::debug;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Reject pattern text that can never name a machine.
///
/// Patterns must not start with `__` and must not contain path characters.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty()
        || pattern.starts_with("__")
        || pattern.contains(['\\', '/', '.'])
    {
        return Err(FleetError::InvalidPattern(pattern.to_string()));
    }
    Ok(())
}

/// Compile a machine pattern
fn compile(pattern: &str) -> Result<Pattern> {
    validate_pattern(pattern)?;
    Pattern::new(pattern).map_err(|_| FleetError::InvalidPattern(pattern.to_string()))
}

/// Pick the machines of this run.
///
/// Every pattern is matched against the key and the display name of each registry entry,
/// and must match at least one of them. Without patterns the whole registry is selected.
///
/// # Arguments
///
/// * `registry` - Loaded registry, consumed
/// * `patterns` - Operator-supplied glob patterns
///
/// # Returns
///
/// The deduplicated union of matches, in registry order
pub fn select_machines<S: AsRef<str>>(registry: Registry, patterns: &[S]) -> Result<Vec<Machine>> {
    if registry.is_empty() {
        return Err(FleetError::EmptyRegistry);
    }

    if patterns.is_empty() {
        return Ok(registry.into_machines().into_values().collect());
    }

    let mut selected = IndexSet::new();
    for text in patterns {
        let text = text.as_ref();
        let pattern = compile(text)?;

        let before = selected.len();
        let mut matched = false;
        for machine in registry.iter() {
            if pattern.matches_with(&machine.key, MATCH_OPTIONS)
                || pattern.matches_with(&machine.name, MATCH_OPTIONS)
            {
                selected.insert(machine.key.clone());
                matched = true;
            }
        }

        if !matched {
            return Err(FleetError::UnmatchedPattern(text.to_string()));
        }
        debug!(pattern = text, added = selected.len() - before, "Pattern matched");
    }

    Ok(registry
        .into_machines()
        .into_iter()
        .filter(|(key, _)| selected.contains(key))
        .map(|(_, machine)| machine)
        .collect())
}
