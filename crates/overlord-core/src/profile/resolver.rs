//! Gap resolver.
//!
//! A template's offset is either set directly or derived from another template of
//! the same profile ("15 minutes before Wake Up"). Derived offsets are a pure
//! function of the reference chain, so every edit that moves an offset walks the
//! templates that depend on it and recomputes them transitively.
//!
//! All functions here operate on the templates of a single profile held in memory.
//! References are by `sort_order`, which stays dense (`1..=n`).
//!
//! ## Invariants
//!
//! - for every template `t` with a relation to `r`: `t.offset == r.offset ∓ t.gap`
//! - the relation graph is acyclic, so propagation terminates
//! - no relation points at a sort order that does not exist

use std::collections::{BTreeMap, HashSet};

use super::types::{AlarmTemplate, GapRelation, OffsetRule, TemplateDraft};
use crate::error::GraphError;

/// A broken invariant found by [`violations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Derived offset does not match its reference.
    Stale {
        sort_order: i32,
        expected: i32,
        actual: i32,
    },
    /// Relation points at a sort order that is not in the profile.
    Dangling { sort_order: i32, reference: i32 },
    /// Relation chain loops back on itself.
    Cycle { sort_order: i32 },
}

fn index_of(templates: &[AlarmTemplate], sort_order: i32) -> Option<usize> {
    templates.iter().position(|t| t.sort_order == sort_order)
}

/// Next free sort order at the end of the profile.
pub fn next_sort_order(templates: &[AlarmTemplate]) -> i32 {
    templates.iter().map(|t| t.sort_order).max().unwrap_or(0) + 1
}

/// Reject a relation from `sort_order` to `reference` that is dangling or would
/// close a cycle.
///
/// Walks the existing chain starting at `reference`. The walk is bounded by the
/// number of templates and tracks visited nodes, so malformed stored data cannot
/// make it loop.
pub fn check_reference(
    templates: &[AlarmTemplate],
    sort_order: i32,
    reference: i32,
) -> Result<(), GraphError> {
    let cycle = GraphError::CycleDetected {
        sort_order,
        reference_sort_order: reference,
    };
    if reference == sort_order {
        return Err(cycle);
    }
    if index_of(templates, reference).is_none() {
        return Err(GraphError::ReferenceNotFound {
            reference_sort_order: reference,
        });
    }

    let mut visited = HashSet::new();
    let mut current = reference;
    for _ in 0..=templates.len() {
        if current == sort_order || !visited.insert(current) {
            return Err(cycle);
        }
        let next = index_of(templates, current)
            .and_then(|i| templates[i].gap)
            .map(|g| g.reference_sort_order);
        match next {
            Some(next) => current = next,
            None => return Ok(()),
        }
    }
    Err(cycle)
}

/// Recompute every template that depends, directly or transitively, on
/// `changed`. Returns the sort orders whose offset moved, in visit order.
pub fn propagate(templates: &mut [AlarmTemplate], changed: i32) -> Vec<i32> {
    let mut moved = Vec::new();
    let mut visited = HashSet::from([changed]);
    let mut stack = vec![changed];

    while let Some(current) = stack.pop() {
        let Some(reference_offset) = index_of(templates, current).map(|i| templates[i].offset_minutes)
        else {
            continue;
        };

        for template in templates.iter_mut() {
            let Some(gap) = template.gap else { continue };
            if gap.reference_sort_order != current || !visited.insert(template.sort_order) {
                continue;
            }
            let new_offset = gap.derive(reference_offset);
            if new_offset != template.offset_minutes {
                template.offset_minutes = new_offset;
                moved.push(template.sort_order);
            }
            stack.push(template.sort_order);
        }
    }

    moved
}

/// Create (`target == None`) or edit the template at `target` from `draft`.
///
/// A `Fixed` rule discards any previous relation. Returns the sort orders of every
/// template the edit touched, the edited one first.
pub fn upsert(
    templates: &mut Vec<AlarmTemplate>,
    profile_id: i64,
    target: Option<i32>,
    draft: &TemplateDraft,
) -> Result<Vec<i32>, GraphError> {
    let sort_order = match target {
        Some(sort_order) => {
            index_of(templates, sort_order).ok_or(GraphError::TemplateNotFound(sort_order))?;
            sort_order
        }
        None => next_sort_order(templates),
    };

    let (offset, gap) = match draft.rule {
        OffsetRule::Fixed { minutes } => (minutes, None),
        OffsetRule::RelativeTo {
            reference_sort_order,
            ..
        } => {
            check_reference(templates, sort_order, reference_sort_order)?;
            let relation = draft.rule.relation();
            let reference_offset = templates[index_of(templates, reference_sort_order)
                .ok_or(GraphError::ReferenceNotFound {
                    reference_sort_order,
                })?]
            .offset_minutes;
            (
                relation.map_or(reference_offset, |r| r.derive(reference_offset)),
                relation,
            )
        }
    };

    match index_of(templates, sort_order) {
        Some(i) => {
            let template = &mut templates[i];
            template.label = draft.label.clone();
            template.offset_minutes = offset;
            template.gap = gap;
            template.sound = draft.sound.clone();
            template.dismissal = draft.dismissal;
            template.vibration_enabled = draft.vibration_enabled;
        }
        None => templates.push(AlarmTemplate {
            id: 0,
            profile_id,
            label: draft.label.clone(),
            offset_minutes: offset,
            sort_order,
            sound: draft.sound.clone(),
            dismissal: draft.dismissal,
            vibration_enabled: draft.vibration_enabled,
            gap,
        }),
    }

    let mut affected = vec![sort_order];
    affected.extend(propagate(templates, sort_order));
    Ok(affected)
}

/// Remove the template at `sort_order`.
///
/// Dependents lose their relation but keep their current offset. Remaining sort
/// orders are renumbered densely and surviving relations are remapped. Returns the
/// (new) sort orders of templates that changed, and the removed template.
pub fn remove(
    templates: &mut Vec<AlarmTemplate>,
    sort_order: i32,
) -> Result<(Vec<i32>, AlarmTemplate), GraphError> {
    let index = index_of(templates, sort_order).ok_or(GraphError::TemplateNotFound(sort_order))?;
    let removed = templates.remove(index);

    let mut touched: HashSet<i64> = HashSet::new();
    for template in templates.iter_mut() {
        if template
            .gap
            .is_some_and(|g| g.reference_sort_order == sort_order)
        {
            template.gap = None;
            touched.insert(template.id);
        }
    }

    templates.sort_by_key(|t| t.sort_order);
    let remap: BTreeMap<i32, i32> = templates
        .iter()
        .enumerate()
        .map(|(i, t)| (t.sort_order, i as i32 + 1))
        .collect();

    let mut affected = Vec::new();
    for template in templates.iter_mut() {
        let new_order = remap[&template.sort_order];
        let mut changed = touched.contains(&template.id) || new_order != template.sort_order;
        template.sort_order = new_order;
        if let Some(gap) = template.gap.as_mut() {
            if let Some(&mapped) = remap.get(&gap.reference_sort_order) {
                changed |= mapped != gap.reference_sort_order;
                gap.reference_sort_order = mapped;
            }
        }
        if changed {
            affected.push(new_order);
        }
    }

    Ok((affected, removed))
}

/// Bring stored templates back to a consistent state.
///
/// Clears dangling, self-referencing and cycle-closing relations (keeping the
/// current offset), then recomputes every derived offset from its fixed root.
/// Returns the sort orders that were modified.
pub fn repair(templates: &mut [AlarmTemplate]) -> Vec<i32> {
    let mut modified = HashSet::new();
    let orders: HashSet<i32> = templates.iter().map(|t| t.sort_order).collect();

    for template in templates.iter_mut() {
        if let Some(gap) = template.gap {
            if gap.reference_sort_order == template.sort_order
                || !orders.contains(&gap.reference_sort_order)
            {
                tracing::warn!(
                    sort_order = template.sort_order,
                    reference = gap.reference_sort_order,
                    "clearing broken gap relation"
                );
                template.gap = None;
                modified.insert(template.sort_order);
            }
        }
    }

    let starts: Vec<i32> = templates
        .iter()
        .filter(|t| t.gap.is_some())
        .map(|t| t.sort_order)
        .collect();
    for start in starts {
        let mut path = HashSet::new();
        let mut current = start;
        loop {
            if !path.insert(current) {
                if let Some(i) = index_of(templates, current) {
                    tracing::warn!(sort_order = current, "breaking gap relation cycle");
                    templates[i].gap = None;
                    modified.insert(current);
                }
                break;
            }
            match index_of(templates, current).and_then(|i| templates[i].gap) {
                Some(gap) => current = gap.reference_sort_order,
                None => break,
            }
        }
    }

    let roots: Vec<i32> = templates
        .iter()
        .filter(|t| t.gap.is_none())
        .map(|t| t.sort_order)
        .collect();
    for root in roots {
        modified.extend(propagate(templates, root));
    }

    let mut modified: Vec<i32> = modified.into_iter().collect();
    modified.sort_unstable();
    modified
}

/// Check every invariant; an empty result means the profile is consistent.
pub fn violations(templates: &[AlarmTemplate]) -> Vec<Violation> {
    let mut found = Vec::new();
    for template in templates {
        let Some(GapRelation {
            reference_sort_order,
            ..
        }) = template.gap
        else {
            continue;
        };
        let Some(reference) = index_of(templates, reference_sort_order).map(|i| &templates[i])
        else {
            found.push(Violation::Dangling {
                sort_order: template.sort_order,
                reference: reference_sort_order,
            });
            continue;
        };
        if check_reference(templates, template.sort_order, reference_sort_order).is_err() {
            found.push(Violation::Cycle {
                sort_order: template.sort_order,
            });
            continue;
        }
        let expected = template
            .gap
            .map_or(template.offset_minutes, |g| g.derive(reference.offset_minutes));
        if expected != template.offset_minutes {
            found.push(Violation::Stale {
                sort_order: template.sort_order,
                expected,
                actual: template.offset_minutes,
            });
        }
    }
    found
}
