#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use nav_tree_core::{
    build_tree, format_rfc3339, now_utc, NavConfig, NavItemInput, NavItemUpdate, NavNode,
    NavRecord, TreeCache,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

const NAV_MIGRATION_VERSION: i64 = 1;

/// A fetch query under construction. Customizers receive it, append filters,
/// and hand it back; filters are applied in registration order.
#[derive(Debug, Default)]
pub struct NavQuery {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl NavQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `WHERE` fragment with positional `?` placeholders and its
    /// bound parameters.
    #[must_use]
    pub fn filter(
        mut self,
        clause: impl Into<String>,
        params: impl IntoIterator<Item = SqlValue>,
    ) -> Self {
        self.clauses.push(clause.into());
        self.params.extend(params);
        self
    }
}

/// Caller-supplied augmentation of a record fetch. The presence of at least
/// one customizer on a fetch forces a cache bypass: the memoized tree cannot
/// represent caller-specific filtering.
pub type QueryCustomizer = Box<dyn Fn(NavQuery) -> NavQuery + Send + Sync>;

/// Customizer matching records whose title contains `needle`.
#[must_use]
pub fn title_contains(needle: &str) -> QueryCustomizer {
    let pattern = format!("%{needle}%");
    Box::new(move |query: NavQuery| query.filter("title LIKE ?", [SqlValue::Text(pattern.clone())]))
}

/// Customizer matching records whose uri starts with `prefix`.
#[must_use]
pub fn uri_prefix(prefix: &str) -> QueryCustomizer {
    let pattern = format!("{prefix}%");
    Box::new(move |query: NavQuery| query.filter("uri LIKE ?", [SqlValue::Text(pattern.clone())]))
}

pub struct SqliteNavStore {
    conn: Connection,
    config: NavConfig,
}

impl SqliteNavStore {
    pub fn open(path: &Path, config: NavConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid navigation configuration: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, config })
    }

    #[must_use]
    pub fn config(&self) -> &NavConfig {
        &self.config
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(&self.schema_sql())
            .context("failed to apply navigation schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![NAV_MIGRATION_VERSION, now],
            )
            .context("failed to register navigation schema migration")?;

        Ok(())
    }

    // `order` is an SQL keyword; the column is stored as sort_order and
    // surfaced as NavRecord::order.
    fn schema_sql(&self) -> String {
        let items = &self.config.items_table;
        let roles = &self.config.role_bindings_table;
        let permissions = &self.config.permission_bindings_table;

        format!(
            "CREATE TABLE IF NOT EXISTS {items} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER,
                sort_order INTEGER NOT NULL DEFAULT 0,
                title TEXT NOT NULL,
                icon TEXT,
                uri TEXT,
                permission_ref TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_{items}_parent_order
               ON {items}(parent_id, sort_order);

             CREATE TABLE IF NOT EXISTS {roles} (
                item_id INTEGER NOT NULL,
                role_id INTEGER NOT NULL,
                PRIMARY KEY (item_id, role_id)
             );

             CREATE TABLE IF NOT EXISTS {permissions} (
                item_id INTEGER NOT NULL,
                permission_id INTEGER NOT NULL,
                PRIMARY KEY (item_id, permission_id)
             );"
        )
    }

    pub fn insert_item(&mut self, input: &NavItemInput) -> Result<NavRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("item validation failed: {err}"))?;

        let now = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;

        tx.execute(
            &format!(
                "INSERT INTO {}(parent_id, sort_order, title, icon, uri, permission_ref, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                self.config.items_table
            ),
            params![
                input.parent_id,
                input.order,
                input.title,
                input.icon,
                input.uri,
                input.permission_ref,
                now,
                now,
            ],
        )
        .context("failed to insert navigation item")?;

        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit insert transaction")?;

        Ok(NavRecord {
            id,
            parent_id: input.parent_id,
            order: input.order,
            title: input.title.clone(),
            icon: input.icon.clone(),
            uri: input.uri.clone(),
            permission_ref: input.permission_ref.clone(),
            roles: None,
            permissions: None,
        })
    }

    pub fn update_item(&self, id: i64, update: &NavItemUpdate) -> Result<NavRecord> {
        update
            .validate(id)
            .map_err(|err| anyhow!("item validation failed: {err}"))?;

        let mut assignments: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(parent_id) = update.parent_id {
            assignments.push("parent_id = ?".to_string());
            values.push(opt_integer(parent_id));
        }
        if let Some(order) = update.order {
            assignments.push("sort_order = ?".to_string());
            values.push(SqlValue::Integer(order));
        }
        if let Some(title) = &update.title {
            assignments.push("title = ?".to_string());
            values.push(SqlValue::Text(title.clone()));
        }
        if let Some(icon) = &update.icon {
            assignments.push("icon = ?".to_string());
            values.push(opt_text(icon.as_deref()));
        }
        if let Some(uri) = &update.uri {
            assignments.push("uri = ?".to_string());
            values.push(opt_text(uri.as_deref()));
        }
        if let Some(permission_ref) = &update.permission_ref {
            assignments.push("permission_ref = ?".to_string());
            values.push(opt_text(permission_ref.as_deref()));
        }

        assignments.push("updated_at = ?".to_string());
        values.push(SqlValue::Text(format_rfc3339(now_utc())?));
        values.push(SqlValue::Integer(id));

        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET {} WHERE id = ?",
                    self.config.items_table,
                    assignments.join(", ")
                ),
                params_from_iter(values.iter()),
            )
            .context("failed to update navigation item")?;

        if changed == 0 {
            return Err(anyhow!("no navigation item with id {id}"));
        }

        self.get_item(id)?
            .ok_or_else(|| anyhow!("navigation item {id} disappeared during update"))
    }

    /// Deletes an item inside one transaction: both association tables are
    /// detached first so no pivot row ever references a missing item.
    pub fn remove_item(&mut self, id: i64) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start delete transaction")?;

        tx.execute(
            &format!(
                "DELETE FROM {} WHERE item_id = ?1",
                self.config.role_bindings_table
            ),
            params![id],
        )
        .context("failed to detach role bindings")?;

        tx.execute(
            &format!(
                "DELETE FROM {} WHERE item_id = ?1",
                self.config.permission_bindings_table
            ),
            params![id],
        )
        .context("failed to detach permission bindings")?;

        let deleted = tx
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.config.items_table),
                params![id],
            )
            .context("failed to delete navigation item")?;

        if deleted == 0 {
            return Err(anyhow!("no navigation item with id {id}"));
        }

        tx.commit().context("failed to commit delete transaction")?;
        Ok(())
    }

    pub fn get_item(&self, id: i64) -> Result<Option<NavRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, parent_id, sort_order, title, icon, uri, permission_ref
             FROM {}
             WHERE id = ?1",
            self.config.items_table
        ))?;

        let record = stmt
            .query_row(params![id], parse_record_row)
            .optional()
            .context("failed to read navigation item")?;

        Ok(record)
    }

    pub fn list_items(&self) -> Result<Vec<NavRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, parent_id, sort_order, title, icon, uri, permission_ref
             FROM {}
             ORDER BY id ASC",
            self.config.items_table
        ))?;

        let rows = stmt.query_map([], parse_record_row)?;
        collect_rows(rows)
    }

    /// Fetches all records, with caller customizations applied in
    /// registration order. Row order is not guaranteed; ordering is the
    /// tree builder's responsibility.
    pub fn fetch_records(&self, customizers: &[QueryCustomizer]) -> Result<Vec<NavRecord>> {
        let mut query = NavQuery::new();
        for customizer in customizers {
            query = customizer(query);
        }

        let mut sql = format!(
            "SELECT id, parent_id, sort_order, title, icon, uri, permission_ref FROM {}",
            self.config.items_table
        );
        if !query.clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&query.clauses.join(" AND "));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(query.params.iter()), parse_record_row)?;
        collect_rows(rows)
    }

    /// Attaches role (and, when `bind_permission` is configured, permission)
    /// binding sets to the given records, each read with one batched query.
    pub fn augment_bindings(&self, records: &mut [NavRecord]) -> Result<()> {
        let mut roles = self.bindings(&self.config.role_bindings_table, "role_id")?;
        for record in records.iter_mut() {
            record.roles = Some(roles.remove(&record.id).unwrap_or_default());
        }

        if self.config.bind_permission {
            let mut permissions =
                self.bindings(&self.config.permission_bindings_table, "permission_id")?;
            for record in records.iter_mut() {
                record.permissions = Some(permissions.remove(&record.id).unwrap_or_default());
            }
        }

        Ok(())
    }

    pub fn bind_role(&self, item_id: i64, role_id: i64) -> Result<()> {
        self.bind(&self.config.role_bindings_table, "role_id", item_id, role_id)
    }

    pub fn unbind_role(&self, item_id: i64, role_id: i64) -> Result<()> {
        self.unbind(&self.config.role_bindings_table, "role_id", item_id, role_id)
    }

    pub fn bind_permission(&self, item_id: i64, permission_id: i64) -> Result<()> {
        self.bind(
            &self.config.permission_bindings_table,
            "permission_id",
            item_id,
            permission_id,
        )
    }

    pub fn unbind_permission(&self, item_id: i64, permission_id: i64) -> Result<()> {
        self.unbind(
            &self.config.permission_bindings_table,
            "permission_id",
            item_id,
            permission_id,
        )
    }

    pub fn role_bindings(&self) -> Result<BTreeMap<i64, BTreeSet<i64>>> {
        self.bindings(&self.config.role_bindings_table, "role_id")
    }

    pub fn permission_bindings(&self) -> Result<BTreeMap<i64, BTreeSet<i64>>> {
        self.bindings(&self.config.permission_bindings_table, "permission_id")
    }

    fn bindings(&self, table: &str, column: &str) -> Result<BTreeMap<i64, BTreeSet<i64>>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT item_id, {column} FROM {table}"))?;
        let mut rows = stmt.query([])?;

        let mut map: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let item_id: i64 = row.get(0)?;
            let bound_id: i64 = row.get(1)?;
            map.entry(item_id).or_default().insert(bound_id);
        }

        Ok(map)
    }

    fn bind(&self, table: &str, column: &str, item_id: i64, bound_id: i64) -> Result<()> {
        if self.get_item(item_id)?.is_none() {
            return Err(anyhow!("no navigation item with id {item_id}"));
        }

        self.conn
            .execute(
                &format!("INSERT OR IGNORE INTO {table}(item_id, {column}) VALUES (?1, ?2)"),
                params![item_id, bound_id],
            )
            .with_context(|| format!("failed to bind {column} {bound_id} to item {item_id}"))?;

        Ok(())
    }

    fn unbind(&self, table: &str, column: &str, item_id: i64, bound_id: i64) -> Result<()> {
        self.conn
            .execute(
                &format!("DELETE FROM {table} WHERE item_id = ?1 AND {column} = ?2"),
                params![item_id, bound_id],
            )
            .with_context(|| format!("failed to unbind {column} {bound_id} from item {item_id}"))?;

        Ok(())
    }
}

/// The navigation tree surface: a store, a process-wide [`TreeCache`], and
/// the mutation handlers that keep the two coherent.
///
/// Every mutation invalidates the cache before returning, so a `fetch_tree`
/// issued after a mutation returns never observes a pre-mutation tree in
/// this process. Invalidation is per process; other processes holding their
/// own service keep serving their memoized tree until their own next
/// mutation.
pub struct NavTreeService {
    store: Mutex<SqliteNavStore>,
    cache: TreeCache,
}

impl NavTreeService {
    #[must_use]
    pub fn new(store: SqliteNavStore) -> Self {
        Self {
            store: Mutex::new(store),
            cache: TreeCache::new(),
        }
    }

    /// Fetches the navigation tree.
    ///
    /// Cache-eligible fetches (no customizers) read and populate the shared
    /// cache; any supplied customizer forces a full bypass in both
    /// directions, since the memoized tree cannot stand in for a
    /// caller-filtered view.
    pub fn fetch_tree(
        &self,
        force_refresh: bool,
        customizers: &[QueryCustomizer],
    ) -> Result<Arc<Vec<NavNode>>> {
        if customizers.is_empty() {
            self.cache
                .get_or_build(force_refresh, || self.load_tree(&[]))
        } else {
            Ok(Arc::new(self.load_tree(customizers)?))
        }
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    #[must_use]
    pub fn is_cache_populated(&self) -> bool {
        self.cache.is_populated()
    }

    pub fn create_item(&self, input: &NavItemInput) -> Result<NavRecord> {
        let record = self.lock_store().insert_item(input)?;
        self.cache.invalidate();
        Ok(record)
    }

    pub fn update_item(&self, id: i64, update: &NavItemUpdate) -> Result<NavRecord> {
        let record = self.lock_store().update_item(id, update)?;
        self.cache.invalidate();
        Ok(record)
    }

    /// Deletes an item: associations are detached before the row goes away,
    /// then the cache is invalidated.
    pub fn delete_item(&self, id: i64) -> Result<()> {
        self.lock_store().remove_item(id)?;
        self.cache.invalidate();
        Ok(())
    }

    pub fn bind_role(&self, item_id: i64, role_id: i64) -> Result<()> {
        self.lock_store().bind_role(item_id, role_id)?;
        self.cache.invalidate();
        Ok(())
    }

    pub fn unbind_role(&self, item_id: i64, role_id: i64) -> Result<()> {
        self.lock_store().unbind_role(item_id, role_id)?;
        self.cache.invalidate();
        Ok(())
    }

    pub fn bind_permission(&self, item_id: i64, permission_id: i64) -> Result<()> {
        self.lock_store().bind_permission(item_id, permission_id)?;
        self.cache.invalidate();
        Ok(())
    }

    pub fn unbind_permission(&self, item_id: i64, permission_id: i64) -> Result<()> {
        self.lock_store().unbind_permission(item_id, permission_id)?;
        self.cache.invalidate();
        Ok(())
    }

    pub fn get_item(&self, id: i64) -> Result<Option<NavRecord>> {
        self.lock_store().get_item(id)
    }

    pub fn list_items(&self) -> Result<Vec<NavRecord>> {
        self.lock_store().list_items()
    }

    fn load_tree(&self, customizers: &[QueryCustomizer]) -> Result<Vec<NavNode>> {
        let store = self.lock_store();
        let mut records = store.fetch_records(customizers)?;
        store.augment_bindings(&mut records)?;
        Ok(build_tree(records))
    }

    // Lock order: the cache entry lock may be held while taking the store
    // lock (miss rebuild). Mutations therefore release the store lock before
    // invalidating.
    fn lock_store(&self) -> MutexGuard<'_, SqliteNavStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NavRecord> {
    Ok(NavRecord {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        order: row.get(2)?,
        title: row.get(3)?,
        icon: row.get(4)?,
        uri: row.get(5)?,
        permission_ref: row.get(6)?,
        roles: None,
        permissions: None,
    })
}

fn opt_integer(value: Option<i64>) -> SqlValue {
    match value {
        Some(inner) => SqlValue::Integer(inner),
        None => SqlValue::Null,
    }
}

fn opt_text(value: Option<&str>) -> SqlValue {
    match value {
        Some(inner) => SqlValue::Text(inner.to_string()),
        None => SqlValue::Null,
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn fixture_store(config: NavConfig) -> SqliteNavStore {
        let store = must(SqliteNavStore::open(Path::new(":memory:"), config));
        must(store.migrate());
        store
    }

    fn fixture_input(title: &str, parent_id: Option<i64>, order: i64) -> NavItemInput {
        NavItemInput {
            parent_id,
            order,
            title: title.to_string(),
            icon: None,
            uri: Some(format!("/{title}")),
            permission_ref: None,
        }
    }

    fn title_filter(needle: &str) -> QueryCustomizer {
        let pattern = format!("%{needle}%");
        Box::new(move |query: NavQuery| {
            query.filter("title LIKE ?", [SqlValue::Text(pattern.clone())])
        })
    }

    #[test]
    fn insert_get_update_list_roundtrip() {
        let mut store = fixture_store(NavConfig::default());

        let created = must(store.insert_item(&fixture_input("dashboard", None, 1)));
        assert_eq!(created.id, 1);

        let fetched = must_some(must(store.get_item(created.id)));
        assert_eq!(fetched, created);

        let update = NavItemUpdate {
            title: Some("home".to_string()),
            uri: Some(None),
            ..NavItemUpdate::default()
        };
        let updated = must(store.update_item(created.id, &update));
        assert_eq!(updated.title, "home");
        assert_eq!(updated.uri, None);

        let _ = must(store.insert_item(&fixture_input("reports", Some(created.id), 2)));
        let items = must(store.list_items());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 1);
        assert_eq!(items[1].parent_id, Some(1));
    }

    #[test]
    fn insert_rejects_empty_title() {
        let mut store = fixture_store(NavConfig::default());
        assert!(store.insert_item(&fixture_input("  ", None, 1)).is_err());
    }

    #[test]
    fn update_of_missing_item_errors() {
        let store = fixture_store(NavConfig::default());
        let update = NavItemUpdate {
            order: Some(3),
            ..NavItemUpdate::default()
        };
        assert!(store.update_item(42, &update).is_err());
    }

    #[test]
    fn update_rejects_self_parent() {
        let mut store = fixture_store(NavConfig::default());
        let created = must(store.insert_item(&fixture_input("a", None, 1)));
        let update = NavItemUpdate {
            parent_id: Some(Some(created.id)),
            ..NavItemUpdate::default()
        };
        assert!(store.update_item(created.id, &update).is_err());
    }

    #[test]
    fn bindings_attach_and_detach_by_id() {
        let mut store = fixture_store(NavConfig::default());
        let item = must(store.insert_item(&fixture_input("secure", None, 1)));

        must(store.bind_role(item.id, 10));
        must(store.bind_role(item.id, 11));
        must(store.bind_role(item.id, 10)); // idempotent
        must(store.bind_permission(item.id, 7));

        let roles = must(store.role_bindings());
        assert_eq!(
            roles.get(&item.id),
            Some(&BTreeSet::from([10_i64, 11_i64]))
        );

        must(store.unbind_role(item.id, 11));
        let roles = must(store.role_bindings());
        assert_eq!(roles.get(&item.id), Some(&BTreeSet::from([10_i64])));

        let permissions = must(store.permission_bindings());
        assert_eq!(permissions.get(&item.id), Some(&BTreeSet::from([7_i64])));
    }

    #[test]
    fn binding_to_missing_item_errors() {
        let store = fixture_store(NavConfig::default());
        assert!(store.bind_role(99, 1).is_err());
    }

    #[test]
    fn augment_attaches_roles_always_and_permissions_by_flag() {
        let mut store = fixture_store(NavConfig::default());
        let item = must(store.insert_item(&fixture_input("a", None, 1)));
        must(store.bind_role(item.id, 3));
        must(store.bind_permission(item.id, 5));

        let mut records = must(store.fetch_records(&[]));
        must(store.augment_bindings(&mut records));
        assert_eq!(records[0].roles, Some(BTreeSet::from([3_i64])));
        assert_eq!(records[0].permissions, None);

        let config = NavConfig {
            bind_permission: true,
            ..NavConfig::default()
        };
        let mut store = fixture_store(config);
        let item = must(store.insert_item(&fixture_input("a", None, 1)));
        must(store.bind_permission(item.id, 5));
        let _ = must(store.insert_item(&fixture_input("plain", None, 2)));

        let mut records = must(store.fetch_records(&[]));
        must(store.augment_bindings(&mut records));
        assert_eq!(records[0].permissions, Some(BTreeSet::from([5_i64])));
        assert_eq!(records[0].roles, Some(BTreeSet::new()));
        assert_eq!(records[1].permissions, Some(BTreeSet::new()));
    }

    #[test]
    fn fetch_applies_customizers_in_registration_order() {
        let mut store = fixture_store(NavConfig::default());
        let _ = must(store.insert_item(&fixture_input("alpha one", None, 1)));
        let _ = must(store.insert_item(&fixture_input("alpha two", None, 2)));
        let _ = must(store.insert_item(&fixture_input("beta one", None, 3)));

        let records = must(store.fetch_records(&[title_filter("alpha")]));
        assert_eq!(records.len(), 2);

        let records = must(store.fetch_records(&[title_filter("alpha"), title_filter("two")]));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "alpha two");
    }

    fn fixture_service() -> NavTreeService {
        NavTreeService::new(fixture_store(NavConfig::default()))
    }

    #[test]
    fn consecutive_gets_share_one_snapshot() {
        let service = fixture_service();
        let _ = must(service.create_item(&fixture_input("a", None, 1)));

        let first = must(service.fetch_tree(false, &[]));
        let second = must(service.fetch_tree(false, &[]));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn mutations_invalidate_the_cache() {
        let service = fixture_service();
        let a = must(service.create_item(&fixture_input("a", None, 1)));
        let before = must(service.fetch_tree(false, &[]));
        assert_eq!(before.len(), 1);
        assert!(service.is_cache_populated());

        let b = must(service.create_item(&fixture_input("b", Some(a.id), 1)));
        assert!(!service.is_cache_populated());
        let after = must(service.fetch_tree(false, &[]));
        assert_eq!(after[0].children.len(), 1);
        assert_eq!(after[0].children[0].record.id, b.id);

        let update = NavItemUpdate {
            title: Some("renamed".to_string()),
            ..NavItemUpdate::default()
        };
        let _ = must(service.update_item(b.id, &update));
        let renamed = must(service.fetch_tree(false, &[]));
        assert_eq!(renamed[0].children[0].record.title, "renamed");
    }

    #[test]
    fn delete_detaches_bindings_before_invalidation() {
        let service = fixture_service();
        let item = must(service.create_item(&fixture_input("doomed", None, 1)));
        must(service.bind_role(item.id, 4));
        must(service.bind_permission(item.id, 9));

        let populated = must(service.fetch_tree(false, &[]));
        assert_eq!(populated.len(), 1);

        must(service.delete_item(item.id));
        assert!(!service.is_cache_populated());

        let tree = must(service.fetch_tree(false, &[]));
        assert!(tree.is_empty());

        let store = service.lock_store();
        assert!(must(store.role_bindings()).is_empty());
        assert!(must(store.permission_bindings()).is_empty());
    }

    #[test]
    fn delete_of_missing_item_leaves_cache_intact() {
        let service = fixture_service();
        let _ = must(service.create_item(&fixture_input("a", None, 1)));
        let _ = must(service.fetch_tree(false, &[]));
        assert!(service.is_cache_populated());

        assert!(service.delete_item(404).is_err());
        assert!(service.is_cache_populated());
    }

    #[test]
    fn customized_fetch_bypasses_cache_in_both_directions() {
        let service = fixture_service();
        let _ = must(service.create_item(&fixture_input("alpha", None, 1)));

        let cached = must(service.fetch_tree(false, &[]));
        assert_eq!(cached.len(), 1);

        // External mutation: write through the store without telling the
        // service, as another process would.
        {
            let mut store = service.lock_store();
            let _ = must(store.insert_item(&fixture_input("alpha late", None, 2)));
        }

        let filtered = must(service.fetch_tree(false, &[title_filter("alpha")]));
        assert_eq!(filtered.len(), 2);

        // The customized result must not have replaced the memoized tree.
        let still_cached = must(service.fetch_tree(false, &[]));
        assert!(Arc::ptr_eq(&cached, &still_cached));
        assert_eq!(still_cached.len(), 1);
    }

    #[test]
    fn force_refresh_picks_up_external_mutations() {
        let service = fixture_service();
        let _ = must(service.create_item(&fixture_input("a", None, 1)));
        let stale = must(service.fetch_tree(false, &[]));
        assert_eq!(stale.len(), 1);

        {
            let mut store = service.lock_store();
            let _ = must(store.insert_item(&fixture_input("b", None, 2)));
        }

        let unforced = must(service.fetch_tree(false, &[]));
        assert_eq!(unforced.len(), 1);

        let forced = must(service.fetch_tree(true, &[]));
        assert_eq!(forced.len(), 2);
    }

    #[test]
    fn tree_orders_roots_and_siblings_by_order_then_id() {
        let service = fixture_service();
        let root = must(service.create_item(&fixture_input("root", None, 5)));
        let _ = must(service.create_item(&fixture_input("first", Some(root.id), 1)));
        let _ = must(service.create_item(&fixture_input("also first", Some(root.id), 1)));
        let early = must(service.create_item(&fixture_input("early root", None, 1)));

        let tree = must(service.fetch_tree(false, &[]));
        assert_eq!(tree[0].record.id, early.id);
        assert_eq!(tree[1].record.id, root.id);
        let children: Vec<i64> = tree[1]
            .children
            .iter()
            .map(|child| child.record.id)
            .collect();
        assert_eq!(children, vec![2, 3]);
    }

    #[test]
    fn custom_table_names_are_honored() {
        let config = NavConfig {
            bind_permission: false,
            items_table: "admin_menu".to_string(),
            role_bindings_table: "admin_role_menu".to_string(),
            permission_bindings_table: "admin_permission_menu".to_string(),
        };
        let mut store = fixture_store(config);
        let item = must(store.insert_item(&fixture_input("a", None, 1)));
        must(store.bind_role(item.id, 1));
        assert_eq!(must(store.role_bindings()).len(), 1);
    }

    #[test]
    fn invalid_config_is_rejected_on_open() {
        let config = NavConfig {
            items_table: "bad name".to_string(),
            ..NavConfig::default()
        };
        assert!(SqliteNavStore::open(Path::new(":memory:"), config).is_err());
    }
}
