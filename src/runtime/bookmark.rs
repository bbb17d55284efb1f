//! Bookmarks, bookmark scopes and the tables that track them
//!
//! A bookmark is the token an activity instance parks on until the host (or
//! the runtime itself) resumes it. Named bookmarks belong to the default
//! namespace or to an explicit `BookmarkScope`; internal bookmarks carry a
//! generated id and are only used by the runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;
use std::ops::BitOr;
use uuid::Uuid;

use super::error::{BookmarkError, BookmarkResult};
use super::instance::InstanceId;

/// Suspension token
///
/// Named bookmarks compare by name and internal bookmarks by id. The two
/// forms never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Bookmark {
    /// Host-visible name
    Named(String),
    /// Runtime-generated id
    Internal(NonZeroU64),
}

impl Bookmark {
    /// Named bookmark
    pub fn new(name: impl Into<String>) -> Self {
        Bookmark::Named(name.into())
    }

    /// Name, if this is a named bookmark
    pub fn name(&self) -> Option<&str> {
        match self {
            Bookmark::Named(name) => Some(name),
            Bookmark::Internal(_) => None,
        }
    }

    /// Id, if this is an internal bookmark
    pub fn id(&self) -> Option<u64> {
        match self {
            Bookmark::Named(_) => None,
            Bookmark::Internal(id) => Some(id.get()),
        }
    }

    /// Whether this bookmark has a name
    pub fn is_named(&self) -> bool {
        matches!(self, Bookmark::Named(_))
    }
}

impl From<&str> for Bookmark {
    fn from(name: &str) -> Self {
        Bookmark::new(name)
    }
}

impl From<String> for Bookmark {
    fn from(name: String) -> Self {
        Bookmark::Named(name)
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bookmark::Named(name) => f.write_str(name),
            Bookmark::Internal(id) => write!(f, "#{}", id),
        }
    }
}

/// Bookmark behavior flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BookmarkOptions(u8);

impl BookmarkOptions {
    /// Single resume, blocks completion of the owner
    pub const NONE: BookmarkOptions = BookmarkOptions(0);
    /// Stays registered after a resumption
    pub const MULTIPLE_RESUME: BookmarkOptions = BookmarkOptions(1);
    /// Does not keep the owner from completing
    pub const NON_BLOCKING: BookmarkOptions = BookmarkOptions(2);

    /// Whether every flag in `other` is set
    pub fn contains(&self, other: BookmarkOptions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits
    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for BookmarkOptions {
    type Output = BookmarkOptions;

    fn bitor(self, rhs: Self) -> Self::Output {
        BookmarkOptions(self.0 | rhs.0)
    }
}

/// Namespace partition for bookmarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookmarkScope {
    /// No explicit scope
    Default,
    /// Registered but not yet given a durable id
    Temporary(u64),
    /// Durable id assigned by the host or an activity
    Durable(Uuid),
}

impl BookmarkScope {
    /// The default, unscoped namespace
    pub const DEFAULT: BookmarkScope = BookmarkScope::Default;

    /// Whether this is the default namespace
    pub fn is_default(&self) -> bool {
        matches!(self, BookmarkScope::Default)
    }

    /// Whether the scope has a durable identity
    pub fn is_initialized(&self) -> bool {
        !matches!(self, BookmarkScope::Temporary(_))
    }

    /// Durable id, if assigned
    pub fn id(&self) -> Option<Uuid> {
        match self {
            BookmarkScope::Durable(id) => Some(*id),
            _ => None,
        }
    }
}

impl Default for BookmarkScope {
    fn default() -> Self {
        BookmarkScope::DEFAULT
    }
}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookmarkScope::Default => f.write_str("default"),
            BookmarkScope::Temporary(id) => write!(f, "temporary:{}", id),
            BookmarkScope::Durable(id) => write!(f, "{}", id),
        }
    }
}

/// A registered bookmark with its owner and callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkRecord {
    /// Token
    pub bookmark: Bookmark,
    /// Instance parked on the bookmark
    pub owner: InstanceId,
    /// Callback tag passed back to the owner on resumption
    pub callback: Option<String>,
    /// Behavior flags
    pub options: BookmarkOptions,
    /// Namespace the bookmark was registered in
    pub scope: BookmarkScope,
}

impl BookmarkRecord {
    /// Whether the record keeps its owner from completing
    pub fn is_blocking(&self) -> bool {
        !self.options.contains(BookmarkOptions::NON_BLOCKING)
    }
}

/// Host-visible description of a named bookmark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkInfo {
    /// Bookmark name
    pub name: String,
    /// Display name of the owning activity
    pub owner_display_name: String,
    /// Scope the bookmark lives in
    pub scope: BookmarkScope,
}

/// Outcome of a host resumption request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookmarkResumptionResult {
    /// Found, and the resumption is scheduled
    Success,
    /// Nothing registered under this bookmark
    NotFound,
    /// Registered but its owner cannot run right now
    NotReady,
}

/// Table lookup outcome used by the executor
#[derive(Debug, Clone)]
pub(crate) enum Resumption {
    Ready(BookmarkRecord),
    NotReady,
    NotFound,
}

/// Bookmark table for one namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "BookmarkTable", from = "BookmarkTable")]
pub struct BookmarkManager {
    bookmarks: BTreeMap<Bookmark, BookmarkRecord>,
    next_id: u64,
}

/// Serialized form of a bookmark table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BookmarkTable {
    bookmarks: Vec<BookmarkRecord>,
    next_id: u64,
}

impl From<BookmarkManager> for BookmarkTable {
    fn from(manager: BookmarkManager) -> Self {
        BookmarkTable {
            bookmarks: manager.bookmarks.into_values().collect(),
            next_id: manager.next_id,
        }
    }
}

impl From<BookmarkTable> for BookmarkManager {
    fn from(table: BookmarkTable) -> Self {
        BookmarkManager {
            bookmarks: table
                .bookmarks
                .into_iter()
                .map(|record| (record.bookmark.clone(), record))
                .collect(),
            next_id: table.next_id,
        }
    }
}

impl BookmarkManager {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bookmark
    pub fn create_bookmark(
        &mut self,
        bookmark: Bookmark,
        owner: InstanceId,
        callback: Option<String>,
        options: BookmarkOptions,
        scope: BookmarkScope,
    ) -> BookmarkResult<BookmarkRecord> {
        if self.bookmarks.contains_key(&bookmark) {
            return Err(BookmarkError::DuplicateName(bookmark.to_string()));
        }
        let record = BookmarkRecord {
            bookmark: bookmark.clone(),
            owner,
            callback,
            options,
            scope,
        };
        self.bookmarks.insert(bookmark, record.clone());
        Ok(record)
    }

    /// Register a bookmark under a fresh internal id
    pub fn create_internal(
        &mut self,
        owner: InstanceId,
        callback: Option<String>,
        options: BookmarkOptions,
    ) -> BookmarkRecord {
        let bookmark = self.generate_temp_bookmark();
        let record = BookmarkRecord {
            bookmark: bookmark.clone(),
            owner,
            callback,
            options,
            scope: BookmarkScope::DEFAULT,
        };
        self.bookmarks.insert(bookmark, record.clone());
        record
    }

    /// Fresh internal bookmark that is not registered
    pub fn generate_temp_bookmark(&mut self) -> Bookmark {
        self.next_id += 1;
        match NonZeroU64::new(self.next_id) {
            Some(id) => Bookmark::Internal(id),
            None => unreachable!("bookmark ids start at 1"),
        }
    }

    /// Remove `bookmark` if `owner` registered it
    pub fn remove(
        &mut self,
        bookmark: &Bookmark,
        owner: InstanceId,
    ) -> BookmarkResult<Option<BookmarkRecord>> {
        match self.bookmarks.get(bookmark) {
            None => Ok(None),
            Some(record) if record.owner != owner => {
                Err(BookmarkError::NotOwner(bookmark.to_string()))
            }
            Some(_) => Ok(self.bookmarks.remove(bookmark)),
        }
    }

    /// Remove every bookmark `owner` registered
    pub fn remove_all(&mut self, owner: InstanceId) -> Vec<BookmarkRecord> {
        let keys: Vec<Bookmark> = self
            .bookmarks
            .values()
            .filter(|record| record.owner == owner)
            .map(|record| record.bookmark.clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.bookmarks.remove(key))
            .collect()
    }

    /// Look up `bookmark` for resumption.
    ///
    /// `is_ready` decides whether the owner may run now. A single-resume
    /// bookmark is removed as part of a successful lookup.
    pub(crate) fn try_generate_work_item<F>(&mut self, bookmark: &Bookmark, is_ready: F) -> Resumption
    where
        F: FnOnce(&BookmarkRecord) -> bool,
    {
        let Some(record) = self.bookmarks.get(bookmark) else {
            return Resumption::NotFound;
        };
        if !is_ready(record) {
            return Resumption::NotReady;
        }
        let record = record.clone();
        if !record.options.contains(BookmarkOptions::MULTIPLE_RESUME) {
            self.bookmarks.remove(bookmark);
        }
        Resumption::Ready(record)
    }

    /// Record registered under `bookmark`
    pub fn get(&self, bookmark: &Bookmark) -> Option<&BookmarkRecord> {
        self.bookmarks.get(bookmark)
    }

    /// Whether `bookmark` is registered
    pub fn contains(&self, bookmark: &Bookmark) -> bool {
        self.bookmarks.contains_key(bookmark)
    }

    /// Bookmarks owned by one instance
    pub fn bookmarks_for(&self, owner: InstanceId) -> impl Iterator<Item = &BookmarkRecord> {
        self.bookmarks.values().filter(move |record| record.owner == owner)
    }

    /// All records in bookmark order
    pub fn records(&self) -> impl Iterator<Item = &BookmarkRecord> {
        self.bookmarks.values()
    }

    /// Describe the named bookmarks, resolving owner display names
    pub fn populate_bookmark_info<F>(&self, display_name: F) -> Vec<BookmarkInfo>
    where
        F: Fn(InstanceId) -> String,
    {
        self.bookmarks
            .values()
            .filter_map(|record| {
                record.bookmark.name().map(|name| BookmarkInfo {
                    name: name.to_string(),
                    owner_display_name: display_name(record.owner),
                    scope: record.scope,
                })
            })
            .collect()
    }

    /// Number of registered bookmarks
    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }

    /// Drop every bookmark
    pub fn clear(&mut self) {
        self.bookmarks.clear();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopeEntry {
    temporary_id: Option<u64>,
    id: Option<Uuid>,
    handle_reference_count: u32,
    bookmarks: BookmarkManager,
}

impl ScopeEntry {
    fn matches(&self, scope: &BookmarkScope) -> bool {
        match scope {
            BookmarkScope::Default => false,
            BookmarkScope::Temporary(t) => self.temporary_id == Some(*t),
            BookmarkScope::Durable(id) => self.id == Some(*id),
        }
    }

    fn scope(&self) -> BookmarkScope {
        match (self.id, self.temporary_id) {
            (Some(id), _) => BookmarkScope::Durable(id),
            (None, Some(t)) => BookmarkScope::Temporary(t),
            (None, None) => unreachable!("scope entry without identity"),
        }
    }
}

/// Registry of explicit bookmark scopes and their bookmark tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookmarkScopeManager {
    scopes: Vec<ScopeEntry>,
    next_temporary_id: u64,
}

impl BookmarkScopeManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, scope: &BookmarkScope) -> BookmarkResult<&ScopeEntry> {
        self.scopes
            .iter()
            .find(|entry| entry.matches(scope))
            .ok_or_else(|| BookmarkError::ScopeNotFound(scope.to_string()))
    }

    fn entry_mut(&mut self, scope: &BookmarkScope) -> BookmarkResult<&mut ScopeEntry> {
        self.scopes
            .iter_mut()
            .find(|entry| entry.matches(scope))
            .ok_or_else(|| BookmarkError::ScopeNotFound(scope.to_string()))
    }

    fn id_in_use(&self, id: Uuid) -> bool {
        self.scopes.iter().any(|entry| entry.id == Some(id))
    }

    /// Register a new scope, durable when `id` is given and temporary otherwise
    pub fn create_and_register_scope(&mut self, id: Option<Uuid>) -> BookmarkResult<BookmarkScope> {
        let entry = match id {
            Some(id) => {
                if self.id_in_use(id) {
                    return Err(BookmarkError::ScopeIdInUse(id));
                }
                ScopeEntry {
                    temporary_id: None,
                    id: Some(id),
                    handle_reference_count: 0,
                    bookmarks: BookmarkManager::new(),
                }
            }
            None => {
                self.next_temporary_id += 1;
                ScopeEntry {
                    temporary_id: Some(self.next_temporary_id),
                    id: None,
                    handle_reference_count: 0,
                    bookmarks: BookmarkManager::new(),
                }
            }
        };
        let scope = entry.scope();
        self.scopes.push(entry);
        Ok(scope)
    }

    /// Give a temporary scope its durable id
    pub fn initialize_scope(&mut self, scope: BookmarkScope, id: Uuid) -> BookmarkResult<BookmarkScope> {
        if self.id_in_use(id) && !self.entry(&scope)?.matches(&BookmarkScope::Durable(id)) {
            return Err(BookmarkError::ScopeIdInUse(id));
        }
        let entry = self.entry_mut(&scope)?;
        if entry.id.is_some() {
            return Err(BookmarkError::ScopeAlreadyInitialized(scope.to_string()));
        }
        entry.id = Some(id);
        for record in entry.bookmarks.bookmarks.values_mut() {
            record.scope = BookmarkScope::Durable(id);
        }
        Ok(BookmarkScope::Durable(id))
    }

    /// Map a temporary scope to its durable form when it has one
    pub fn canonical(&self, scope: BookmarkScope) -> BookmarkScope {
        match scope {
            BookmarkScope::Temporary(_) => self
                .entry(&scope)
                .map(|entry| entry.scope())
                .unwrap_or(scope),
            other => other,
        }
    }

    /// Remove a scope, returning the bookmarks it still held
    pub fn unregister_scope(&mut self, scope: BookmarkScope) -> BookmarkResult<Vec<BookmarkRecord>> {
        let index = self
            .scopes
            .iter()
            .position(|entry| entry.matches(&scope))
            .ok_or_else(|| BookmarkError::ScopeNotFound(scope.to_string()))?;
        let entry = self.scopes.remove(index);
        Ok(entry.bookmarks.bookmarks.into_values().collect())
    }

    /// Whether the scope is registered
    pub fn is_registered(&self, scope: BookmarkScope) -> bool {
        self.entry(&scope).is_ok()
    }

    /// Record one more handle attached to the scope
    pub fn increment_handle_reference_count(&mut self, scope: BookmarkScope) -> BookmarkResult<u32> {
        let entry = self.entry_mut(&scope)?;
        entry.handle_reference_count += 1;
        Ok(entry.handle_reference_count)
    }

    /// Record one handle detached from the scope
    pub fn decrement_handle_reference_count(&mut self, scope: BookmarkScope) -> BookmarkResult<u32> {
        let entry = self.entry_mut(&scope)?;
        assert!(entry.handle_reference_count > 0, "bookmark scope handle count underflow");
        entry.handle_reference_count -= 1;
        Ok(entry.handle_reference_count)
    }

    /// Handles currently attached to the scope
    pub fn handle_reference_count(&self, scope: BookmarkScope) -> Option<u32> {
        self.entry(&scope).ok().map(|entry| entry.handle_reference_count)
    }

    /// Register a named bookmark inside a scope
    pub fn create_bookmark(
        &mut self,
        bookmark: Bookmark,
        scope: BookmarkScope,
        owner: InstanceId,
        callback: Option<String>,
        options: BookmarkOptions,
    ) -> BookmarkResult<BookmarkRecord> {
        let scope = self.canonical(scope);
        let entry = self.entry_mut(&scope)?;
        entry.bookmarks.create_bookmark(bookmark, owner, callback, options, scope)
    }

    /// Remove a scoped bookmark if `owner` registered it
    pub fn remove(
        &mut self,
        bookmark: &Bookmark,
        scope: BookmarkScope,
        owner: InstanceId,
    ) -> BookmarkResult<Option<BookmarkRecord>> {
        self.entry_mut(&scope)?.bookmarks.remove(bookmark, owner)
    }

    /// Remove every scoped bookmark `owner` registered
    pub fn remove_all(&mut self, owner: InstanceId) -> Vec<BookmarkRecord> {
        self.scopes
            .iter_mut()
            .flat_map(|entry| entry.bookmarks.remove_all(owner))
            .collect()
    }

    pub(crate) fn try_generate_work_item<F>(
        &mut self,
        bookmark: &Bookmark,
        scope: BookmarkScope,
        is_ready: F,
    ) -> Resumption
    where
        F: FnOnce(&BookmarkRecord) -> bool,
    {
        match self.entry_mut(&scope) {
            Ok(entry) => entry.bookmarks.try_generate_work_item(bookmark, is_ready),
            Err(_) => Resumption::NotFound,
        }
    }

    /// Named bookmarks registered in one scope
    pub fn get_bookmarks<F>(&self, scope: BookmarkScope, display_name: F) -> Vec<BookmarkInfo>
    where
        F: Fn(InstanceId) -> String,
    {
        self.entry(&scope)
            .map(|entry| entry.bookmarks.populate_bookmark_info(display_name))
            .unwrap_or_default()
    }

    /// Named bookmarks across every scope
    pub fn all_bookmarks<F>(&self, display_name: F) -> Vec<BookmarkInfo>
    where
        F: Fn(InstanceId) -> String,
    {
        self.scopes
            .iter()
            .flat_map(|entry| entry.bookmarks.populate_bookmark_info(&display_name))
            .collect()
    }

    /// Registered scopes
    pub fn scopes(&self) -> impl Iterator<Item = BookmarkScope> + '_ {
        self.scopes.iter().map(ScopeEntry::scope)
    }

    /// Drop every scope
    pub fn clear(&mut self) {
        self.scopes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(bookmark: &Bookmark) -> u64 {
        let mut hasher = DefaultHasher::new();
        bookmark.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_bookmark_equality() {
        let a = Bookmark::new("approve");
        let b = Bookmark::from("approve");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let one = Bookmark::Internal(NonZeroU64::new(1).unwrap());
        let also_one = Bookmark::Internal(NonZeroU64::new(1).unwrap());
        let two = Bookmark::Internal(NonZeroU64::new(2).unwrap());
        assert_eq!(one, also_one);
        assert_ne!(one, two);
        assert_ne!(Bookmark::new("1"), one);
    }

    #[test]
    fn test_options_flags() {
        let options = BookmarkOptions::MULTIPLE_RESUME | BookmarkOptions::NON_BLOCKING;
        assert!(options.contains(BookmarkOptions::MULTIPLE_RESUME));
        assert!(options.contains(BookmarkOptions::NON_BLOCKING));
        assert!(!BookmarkOptions::NONE.contains(BookmarkOptions::NON_BLOCKING));
    }

    #[test]
    fn test_single_resume_removes_bookmark() {
        let mut manager = BookmarkManager::new();
        let owner = InstanceId(1);
        manager
            .create_bookmark(Bookmark::new("B1"), owner, None, BookmarkOptions::NONE, BookmarkScope::DEFAULT)
            .unwrap();

        assert!(matches!(
            manager.try_generate_work_item(&Bookmark::new("B1"), |_| true),
            Resumption::Ready(record) if record.owner == owner
        ));
        assert!(matches!(
            manager.try_generate_work_item(&Bookmark::new("B1"), |_| true),
            Resumption::NotFound
        ));
    }

    #[test]
    fn test_multiple_resume_and_not_ready() {
        let mut manager = BookmarkManager::new();
        manager
            .create_bookmark(
                Bookmark::new("tick"),
                InstanceId(3),
                Some("on_tick".into()),
                BookmarkOptions::MULTIPLE_RESUME,
                BookmarkScope::DEFAULT,
            )
            .unwrap();

        assert!(matches!(
            manager.try_generate_work_item(&Bookmark::new("tick"), |_| false),
            Resumption::NotReady
        ));
        for _ in 0..3 {
            assert!(matches!(
                manager.try_generate_work_item(&Bookmark::new("tick"), |_| true),
                Resumption::Ready(_)
            ));
        }
        assert!(manager.contains(&Bookmark::new("tick")));
    }

    #[test]
    fn test_duplicate_and_owner_checks() {
        let mut manager = BookmarkManager::new();
        let bookmark = Bookmark::new("dup");
        manager
            .create_bookmark(bookmark.clone(), InstanceId(1), None, BookmarkOptions::NONE, BookmarkScope::DEFAULT)
            .unwrap();
        assert_eq!(
            manager
                .create_bookmark(bookmark.clone(), InstanceId(2), None, BookmarkOptions::NONE, BookmarkScope::DEFAULT)
                .unwrap_err(),
            BookmarkError::DuplicateName("dup".into())
        );
        assert!(manager.remove(&bookmark, InstanceId(2)).is_err());
        assert!(manager.remove(&bookmark, InstanceId(1)).unwrap().is_some());
        assert!(manager.remove(&bookmark, InstanceId(1)).unwrap().is_none());
    }

    #[test]
    fn test_internal_ids_are_sequential() {
        let mut manager = BookmarkManager::new();
        let a = manager.create_internal(InstanceId(1), None, BookmarkOptions::NON_BLOCKING);
        let b = manager.generate_temp_bookmark();
        assert_eq!(a.bookmark.id(), Some(1));
        assert_eq!(b.id(), Some(2));
        assert!(!a.is_blocking());
        assert!(!manager.contains(&b));
    }

    #[test]
    fn test_table_serializes_as_list() {
        let mut manager = BookmarkManager::new();
        manager
            .create_bookmark(Bookmark::new("x"), InstanceId(1), None, BookmarkOptions::NONE, BookmarkScope::DEFAULT)
            .unwrap();
        manager.create_internal(InstanceId(1), None, BookmarkOptions::NONE);

        let json = serde_json::to_string(&manager).unwrap();
        let back: BookmarkManager = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back.contains(&Bookmark::new("x")));
        assert_eq!(back.clone().generate_temp_bookmark().id(), Some(2));
    }

    #[test]
    fn test_scoped_lookup_does_not_leak_into_default() {
        let mut scopes = BookmarkScopeManager::new();
        let mut default = BookmarkManager::new();
        let scope = scopes.create_and_register_scope(None).unwrap();
        scopes
            .create_bookmark(Bookmark::new("reply"), scope, InstanceId(7), None, BookmarkOptions::NONE)
            .unwrap();

        assert!(matches!(
            default.try_generate_work_item(&Bookmark::new("reply"), |_| true),
            Resumption::NotFound
        ));
        assert!(matches!(
            scopes.try_generate_work_item(&Bookmark::new("reply"), scope, |_| true),
            Resumption::Ready(_)
        ));
    }

    #[test]
    fn test_scope_initialization() {
        let mut scopes = BookmarkScopeManager::new();
        let temporary = scopes.create_and_register_scope(None).unwrap();
        assert!(!temporary.is_initialized());

        let id = Uuid::new_v4();
        let durable = scopes.initialize_scope(temporary, id).unwrap();
        assert_eq!(durable, BookmarkScope::Durable(id));
        assert_eq!(scopes.canonical(temporary), durable);
        assert!(matches!(
            scopes.initialize_scope(durable, Uuid::new_v4()),
            Err(BookmarkError::ScopeAlreadyInitialized(_))
        ));
        assert!(matches!(
            scopes.create_and_register_scope(Some(id)),
            Err(BookmarkError::ScopeIdInUse(_))
        ));
    }

    #[test]
    fn test_scope_reference_counting() {
        let mut scopes = BookmarkScopeManager::new();
        let scope = scopes.create_and_register_scope(Some(Uuid::new_v4())).unwrap();
        assert_eq!(scopes.increment_handle_reference_count(scope).unwrap(), 1);
        assert_eq!(scopes.increment_handle_reference_count(scope).unwrap(), 2);
        assert_eq!(scopes.decrement_handle_reference_count(scope).unwrap(), 1);
        assert_eq!(scopes.handle_reference_count(scope), Some(1));
        scopes.unregister_scope(scope).unwrap();
        assert!(!scopes.is_registered(scope));
        assert!(scopes.increment_handle_reference_count(scope).is_err());
    }
}
