//! Dependency resolution: turns the step graph into a linear application order.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use evolve_core::error::{EvolveError, Result};
use evolve_core::migration::{MigrationStep, StepKey};

/// Compute an application order in which every step follows all of its
/// dependencies.
///
/// Among steps that are ready at the same time the lexically smallest
/// `(schema, step_id)` goes first, so the order is deterministic.
pub fn resolve(steps: &[MigrationStep]) -> Result<Vec<&MigrationStep>> {
    let mut index: BTreeMap<&StepKey, &MigrationStep> = BTreeMap::new();
    for step in steps {
        if index.insert(&step.key, step).is_some() {
            return Err(EvolveError::DuplicateStep(step.key.clone()));
        }
    }

    // Validate references in lexical order so the reported error is stable.
    for step in index.values() {
        for dep in &step.dependencies {
            if !index.contains_key(dep) {
                return Err(EvolveError::UnresolvedDependency {
                    schema: dep.schema.clone(),
                    step_id: dep.step_id.clone(),
                    required_by: step.key.clone(),
                });
            }
        }
    }

    let mut in_degree: BTreeMap<&StepKey, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&StepKey, Vec<&StepKey>> = BTreeMap::new();
    for (&key, &step) in &index {
        let unique: BTreeSet<&StepKey> = step.dependencies.iter().collect();
        in_degree.insert(key, unique.len());
        for dep in unique {
            dependents.entry(dep).or_default().push(key);
        }
    }

    let mut ready: BTreeSet<&StepKey> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(key, _)| *key)
        .collect();

    let mut order = Vec::with_capacity(index.len());
    while let Some(key) = ready.pop_first() {
        order.push(index[key]);
        if let Some(children) = dependents.get(key) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }

    if order.len() < index.len() {
        let placed: HashSet<&StepKey> = order.iter().map(|s| &s.key).collect();
        let remaining: BTreeSet<&StepKey> = index
            .keys()
            .copied()
            .filter(|k| !placed.contains(k))
            .collect();
        return Err(EvolveError::CyclicDependency {
            steps: cycle_members(remaining, &dependents),
        });
    }

    Ok(order)
}

/// Strip steps that only hang off a cycle, leaving the steps that take part in one.
fn cycle_members(
    mut remaining: BTreeSet<&StepKey>,
    dependents: &BTreeMap<&StepKey, Vec<&StepKey>>,
) -> Vec<StepKey> {
    loop {
        let leaves: Vec<&StepKey> = remaining
            .iter()
            .copied()
            .filter(|key| {
                dependents
                    .get(key)
                    .map(|children| children.iter().all(|c| !remaining.contains(c)))
                    .unwrap_or(true)
            })
            .collect();
        if leaves.is_empty() {
            break;
        }
        for leaf in leaves {
            remaining.remove(leaf);
        }
    }
    remaining.into_iter().cloned().collect()
}

/// Keys of resolved steps that are not in the applied set, in order.
pub fn pending<'a>(order: &[&'a MigrationStep], applied: &HashSet<StepKey>) -> Vec<&'a StepKey> {
    order
        .iter()
        .filter(|s| !applied.contains(&s.key))
        .map(|s| &s.key)
        .collect()
}
