//! Derivation of [`DotMeta`] for a set of dots.
//!
//! The store does not keep depth, child counts or routes; they are derived
//! here from the parent links before dots are forwarded as [`MetaDot`]s.
//!
//! [`MetaDot`]: crate::MetaDot

use std::collections::{BTreeMap, BTreeSet};

use crate::ids::DotId;
use crate::structs::{Dot, DotMeta};

/// Separator between names in a routing key.
pub const ROUTE_SEPARATOR: char = '/';

/// Errors that can occur while deriving hierarchy metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HierarchyError {
    /// Two dots share the same id.
    #[error("duplicate dot id {id}")]
    DuplicateId {
        /// The repeated id.
        id: DotId,
    },

    /// A non-root dot references a parent that is not in the set.
    #[error("dot {id} references missing parent {parent}")]
    OrphanParent {
        /// The dot with the dangling link.
        id: DotId,
        /// The missing parent.
        parent: DotId,
    },

    /// Following parent links from a dot never reaches the root.
    #[error("dot {id} is part of a parent cycle")]
    Cycle {
        /// A dot on the cycle.
        id: DotId,
    },
}

/// Derive parent name, depth, child count and route for every dot.
///
/// The root (id 0) may be absent from `dots`; top-level dots then hang off
/// an implicit root with an empty name.
///
/// # Errors
///
/// Returns [`HierarchyError`] on duplicate ids, dangling parent links or
/// parent cycles.
pub fn derive_meta(dots: &[Dot]) -> Result<BTreeMap<DotId, DotMeta>, HierarchyError> {
    let mut by_id: BTreeMap<DotId, &Dot> = BTreeMap::new();
    for dot in dots {
        if by_id.insert(dot.id, dot).is_some() {
            return Err(HierarchyError::DuplicateId { id: dot.id });
        }
    }

    let mut children: BTreeMap<DotId, u64> = BTreeMap::new();
    for dot in dots.iter().filter(|d| !d.is_root()) {
        if !dot.parent_id.is_root() && !by_id.contains_key(&dot.parent_id) {
            return Err(HierarchyError::OrphanParent {
                id: dot.id,
                parent: dot.parent_id,
            });
        }
        let count = children.entry(dot.parent_id).or_default();
        *count = count.saturating_add(1);
    }

    // (depth, route) per resolved dot.
    let mut resolved: BTreeMap<DotId, (u64, String)> = BTreeMap::new();
    resolved.insert(DotId::ROOT, (0, String::new()));

    for dot in dots {
        let mut chain: Vec<DotId> = Vec::new();
        let mut seen: BTreeSet<DotId> = BTreeSet::new();
        let mut cursor = dot.id;
        while !resolved.contains_key(&cursor) {
            if !seen.insert(cursor) {
                return Err(HierarchyError::Cycle { id: cursor });
            }
            chain.push(cursor);
            cursor = by_id
                .get(&cursor)
                .map_or(DotId::ROOT, |d| d.parent_id);
        }

        for id in chain.into_iter().rev() {
            let Some(current) = by_id.get(&id) else {
                continue;
            };
            let (parent_depth, parent_route) = resolved
                .get(&current.parent_id)
                .cloned()
                .unwrap_or_default();
            let route = if parent_route.is_empty() {
                current.name.clone()
            } else {
                format!("{parent_route}{ROUTE_SEPARATOR}{}", current.name)
            };
            resolved.insert(id, (parent_depth.saturating_add(1), route));
        }
    }

    let mut out = BTreeMap::new();
    for dot in dots {
        let parent_name = if dot.is_root() {
            String::new()
        } else {
            by_id
                .get(&dot.parent_id)
                .filter(|p| !p.is_root())
                .map(|p| p.name.clone())
                .unwrap_or_default()
        };
        let (depth, route) = resolved.get(&dot.id).cloned().unwrap_or_default();
        out.insert(
            dot.id,
            DotMeta {
                parent_name,
                depth,
                children: children.get(&dot.id).copied().unwrap_or(0),
                route,
            },
        );
    }

    Ok(out)
}
