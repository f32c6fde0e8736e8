use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NavError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// One flat row from the navigation store. `roles` and `permissions` stay
/// `None` unless binding augmentation ran for the fetch that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavRecord {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub order: i64,
    pub title: String,
    pub icon: Option<String>,
    pub uri: Option<String>,
    pub permission_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeSet<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<BTreeSet<i64>>,
}

/// A record plus its exclusively owned children, ordered by `(order, id)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavNode {
    #[serde(flatten)]
    pub record: NavRecord,
    pub children: Vec<NavNode>,
}

impl NavNode {
    /// Total number of records in this node's subtree, itself included.
    #[must_use]
    pub fn subtree_len(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(NavNode::subtree_len)
            .sum::<usize>()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavItemInput {
    pub parent_id: Option<i64>,
    pub order: i64,
    pub title: String,
    pub icon: Option<String>,
    pub uri: Option<String>,
    pub permission_ref: Option<String>,
}

impl NavItemInput {
    /// Validates a new navigation item before insert.
    ///
    /// # Errors
    /// Returns [`NavError::Validation`] when required fields are missing.
    pub fn validate(&self) -> Result<(), NavError> {
        if self.title.trim().is_empty() {
            return Err(NavError::Validation(
                "title MUST be provided for every item".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update for an existing item. Outer `None` means "leave unchanged";
/// `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavItemUpdate {
    pub parent_id: Option<Option<i64>>,
    pub order: Option<i64>,
    pub title: Option<String>,
    pub icon: Option<Option<String>>,
    pub uri: Option<Option<String>>,
    pub permission_ref: Option<Option<String>>,
}

impl NavItemUpdate {
    /// Validates the changed fields of a partial update.
    ///
    /// # Errors
    /// Returns [`NavError::Validation`] when a changed field violates item
    /// constraints, or when the update would make the item its own parent.
    pub fn validate(&self, id: i64) -> Result<(), NavError> {
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(NavError::Validation(
                    "title MUST NOT be set to an empty value".to_string(),
                ));
            }
        }

        if self.parent_id == Some(Some(id)) {
            return Err(NavError::Validation(format!(
                "item {id} cannot be its own parent"
            )));
        }

        Ok(())
    }
}

/// Navigation configuration consumed, not owned, by this crate.
///
/// Table names are interpolated into SQL by the store and are restricted to
/// identifier characters.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavConfig {
    pub bind_permission: bool,
    pub items_table: String,
    pub role_bindings_table: String,
    pub permission_bindings_table: String,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            bind_permission: false,
            items_table: "nav_items".to_string(),
            role_bindings_table: "nav_item_roles".to_string(),
            permission_bindings_table: "nav_item_permissions".to_string(),
        }
    }
}

impl NavConfig {
    /// Validates table-name configuration.
    ///
    /// # Errors
    /// Returns [`NavError::Configuration`] when a table name is empty or
    /// contains characters outside `[A-Za-z0-9_]`, or when two tables share
    /// a name.
    pub fn validate(&self) -> Result<(), NavError> {
        for (field, value) in [
            ("items_table", &self.items_table),
            ("role_bindings_table", &self.role_bindings_table),
            ("permission_bindings_table", &self.permission_bindings_table),
        ] {
            if value.is_empty() {
                return Err(NavError::Configuration(format!(
                    "{field} MUST NOT be empty"
                )));
            }
            if value.chars().next().is_some_and(|first| first.is_ascii_digit()) {
                return Err(NavError::Configuration(format!(
                    "{field} MUST NOT start with a digit: {value}"
                )));
            }
            if !value
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
            {
                return Err(NavError::Configuration(format!(
                    "{field} MUST match [A-Za-z0-9_]+: {value}"
                )));
            }
        }

        let distinct: BTreeSet<&str> = [
            self.items_table.as_str(),
            self.role_bindings_table.as_str(),
            self.permission_bindings_table.as_str(),
        ]
        .into_iter()
        .collect();
        if distinct.len() != 3 {
            return Err(NavError::Configuration(
                "table names MUST be pairwise distinct".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parent-edge classification used by [`build_tree`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum EdgeState {
    OnStack,
    Kept,
    Severed,
}

/// Assembles a nested tree from flat parent-pointer records.
///
/// Roots are records whose `parent_id` is null, does not resolve to any id in
/// the set, or lies on a parent-pointer cycle. Cycle members have their parent
/// edge severed and are reinserted as additional roots; records hanging below
/// a cycle keep their edge. Every input record appears in the result exactly
/// once, and siblings (roots included) are ordered by `(order, id)` ascending.
#[must_use]
pub fn build_tree(records: Vec<NavRecord>) -> Vec<NavNode> {
    let ids: BTreeSet<i64> = records.iter().map(|record| record.id).collect();

    // Effective parent: null, dangling, and self references are already severed.
    let parent_of: BTreeMap<i64, Option<i64>> = records
        .iter()
        .map(|record| {
            let parent = record
                .parent_id
                .filter(|parent| *parent != record.id && ids.contains(parent));
            (record.id, parent)
        })
        .collect();

    let states = classify_edges(&parent_of);

    let sort_key: BTreeMap<i64, (i64, i64)> = records
        .iter()
        .map(|record| (record.id, (record.order, record.id)))
        .collect();

    let mut roots: Vec<i64> = Vec::new();
    let mut children_of: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for record in &records {
        match parent_of.get(&record.id).copied().flatten() {
            Some(parent) if states.get(&record.id) == Some(&EdgeState::Kept) => {
                children_of.entry(parent).or_default().push(record.id);
            }
            _ => roots.push(record.id),
        }
    }

    let key_of = |id: &i64| sort_key.get(id).copied().unwrap_or((0, *id));
    roots.sort_by_key(key_of);
    for siblings in children_of.values_mut() {
        siblings.sort_by_key(key_of);
    }

    let mut by_id: BTreeMap<i64, NavRecord> = records
        .into_iter()
        .map(|record| (record.id, record))
        .collect();

    roots
        .iter()
        .filter_map(|root| assemble(*root, &mut by_id, &children_of))
        .collect()
}

/// Walks parent chains once per record, marking each record's parent edge as
/// kept or severed. A record whose chain re-enters the current walk stack is
/// on a cycle and loses its edge; everything reaching a terminated chain (or
/// an already-broken cycle member) keeps its edge.
fn classify_edges(parent_of: &BTreeMap<i64, Option<i64>>) -> BTreeMap<i64, EdgeState> {
    let mut states: BTreeMap<i64, EdgeState> = BTreeMap::new();

    for start in parent_of.keys() {
        if states.contains_key(start) {
            continue;
        }

        let mut stack: Vec<i64> = Vec::new();
        let mut current = *start;
        loop {
            states.insert(current, EdgeState::OnStack);
            stack.push(current);

            let Some(parent) = parent_of.get(&current).copied().flatten() else {
                settle(&mut states, &stack, stack.len());
                break;
            };

            match states.get(&parent) {
                None => current = parent,
                Some(EdgeState::OnStack) => {
                    let cycle_start = stack
                        .iter()
                        .position(|candidate| *candidate == parent)
                        .unwrap_or(stack.len());
                    for member in &stack[cycle_start..] {
                        states.insert(*member, EdgeState::Severed);
                    }
                    settle(&mut states, &stack, cycle_start);
                    break;
                }
                Some(EdgeState::Kept | EdgeState::Severed) => {
                    settle(&mut states, &stack, stack.len());
                    break;
                }
            }
        }
    }

    states
}

fn settle(states: &mut BTreeMap<i64, EdgeState>, stack: &[i64], upto: usize) {
    for member in &stack[..upto.min(stack.len())] {
        states.insert(*member, EdgeState::Kept);
    }
}

fn assemble(
    id: i64,
    by_id: &mut BTreeMap<i64, NavRecord>,
    children_of: &BTreeMap<i64, Vec<i64>>,
) -> Option<NavNode> {
    let record = by_id.remove(&id)?;
    let mut node = NavNode {
        record,
        children: Vec::new(),
    };

    if let Some(child_ids) = children_of.get(&id) {
        for child in child_ids {
            if let Some(child_node) = assemble(*child, by_id, children_of) {
                node.children.push(child_node);
            }
        }
    }

    Some(node)
}

/// Process-wide memoization of the last built tree.
///
/// Staleness is event-driven: the entry lives until the next
/// [`TreeCache::invalidate`] and is never expired by time. The entry mutex is
/// held across a miss rebuild, so at most one rebuild runs per invalidation
/// cycle and no caller observes a half-populated entry. A failed rebuild
/// leaves the prior entry unchanged.
///
/// Each process owns its cache: a mutation in one process does not invalidate
/// the tree memoized by another.
#[derive(Debug, Default)]
pub struct TreeCache {
    entry: Mutex<Option<Arc<Vec<NavNode>>>>,
}

impl TreeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the memoized tree, rebuilding through `build` when
    /// `force_refresh` is set or no entry exists.
    ///
    /// # Errors
    /// Propagates the error returned by `build` unchanged, without touching
    /// the cached entry.
    pub fn get_or_build<E>(
        &self,
        force_refresh: bool,
        build: impl FnOnce() -> Result<Vec<NavNode>, E>,
    ) -> Result<Arc<Vec<NavNode>>, E> {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);

        if !force_refresh {
            if let Some(tree) = entry.as_ref() {
                return Ok(Arc::clone(tree));
            }
        }

        let tree = Arc::new(build()?);
        *entry = Some(Arc::clone(&tree));
        Ok(tree)
    }

    /// Clears the entry. Idempotent.
    pub fn invalidate(&self) {
        *self.entry.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`NavError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, NavError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| NavError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(NavError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`NavError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, NavError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| NavError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
