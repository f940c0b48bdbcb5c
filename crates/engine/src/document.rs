// In-memory document cache and the mutation pipeline's diff logic

use protocol::Document;
use serde_json::Value;
use std::fmt;

/// A requested change to the document
///
/// Either a partial document (its fields replace the current ones) or a
/// function from the current document to the next one.
pub enum Mutation {
    Partial(Document),
    Update(Box<dyn FnOnce(&Document) -> Document + Send>),
}

impl Mutation {
    /// Function-style mutation
    pub fn update<F>(f: F) -> Self
    where
        F: FnOnce(&Document) -> Document + Send + 'static,
    {
        Mutation::Update(Box::new(f))
    }

    /// Single-field partial mutation
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        let mut partial = Document::new();
        partial.insert(field.into(), value);
        Mutation::Partial(partial)
    }

    /// Prepend `entry` to the list in `field`, keeping the newest `cap` entries.
    ///
    /// A missing or non-list field starts a fresh list.
    pub fn prepend_capped(field: impl Into<String>, entry: Value, cap: usize) -> Self {
        let field = field.into();
        Mutation::update(move |current| {
            let mut entries = vec![entry];
            if let Some(Value::Array(existing)) = current.get(&field) {
                entries.extend(existing.iter().cloned());
            }
            entries.truncate(cap);

            let mut next = current.clone();
            next.insert(field, Value::Array(entries));
            next
        })
    }
}

impl From<Document> for Mutation {
    fn from(partial: Document) -> Self {
        Mutation::Partial(partial)
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Partial(partial) => f.debug_tuple("Partial").field(partial).finish(),
            Mutation::Update(_) => f.write_str("Update(..)"),
        }
    }
}

/// Fields whose value actually changed, with their new values.
///
/// A removed field is reported as `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    fields: Document,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn as_document(&self) -> &Document {
        &self.fields
    }

    fn record(&mut self, field: String, value: Value) {
        self.fields.insert(field, value);
    }
}

// Absent and null are the same state for a field.
fn same_value(current: Option<&Value>, next: Option<&Value>) -> bool {
    let current = current.unwrap_or(&Value::Null);
    let next = next.unwrap_or(&Value::Null);
    current == next
}

/// Holds the current document; the single writer of the local replica
#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    current: Document,
}

impl DocumentStore {
    pub fn new(initial: Document) -> Self {
        let mut store = DocumentStore::default();
        store.replace(initial);
        store
    }

    pub fn document(&self) -> &Document {
        &self.current
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.current.get(field)
    }

    /// Apply a local mutation and return exactly the fields that changed.
    ///
    /// Comparison is structural, so rebuilding an equal value is not a change.
    pub fn apply(&mut self, mutation: Mutation) -> ChangeSet {
        match mutation {
            Mutation::Partial(partial) => {
                let mut changes = ChangeSet::default();
                for (field, value) in partial {
                    self.write_field(field, value, &mut changes);
                }
                changes
            }
            Mutation::Update(f) => {
                let next = f(&self.current);
                self.replace(next)
            }
        }
    }

    /// Replace the whole document, reporting dropped fields as null.
    pub fn replace(&mut self, next: Document) -> ChangeSet {
        let mut changes = ChangeSet::default();

        let removed: Vec<String> = self
            .current
            .keys()
            .filter(|field| !next.contains_key(field.as_str()))
            .cloned()
            .collect();
        for field in removed {
            self.write_field(field, Value::Null, &mut changes);
        }

        for (field, value) in next {
            self.write_field(field, value, &mut changes);
        }

        changes
    }

    /// Merge remote field values, skipping any field `accept` rejects.
    ///
    /// Fields missing from `updates` are left alone.
    pub fn merge_remote<F>(&mut self, updates: Document, mut accept: F) -> ChangeSet
    where
        F: FnMut(&str) -> bool,
    {
        let mut changes = ChangeSet::default();
        for (field, value) in updates {
            if accept(&field) {
                self.write_field(field, value, &mut changes);
            }
        }
        changes
    }

    fn write_field(&mut self, field: String, value: Value, changes: &mut ChangeSet) {
        if same_value(self.current.get(&field), Some(&value)) {
            return;
        }

        if value.is_null() {
            self.current.remove(&field);
        } else {
            self.current.insert(field.clone(), value.clone());
        }
        changes.record(field, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    #[test]
    fn test_partial_reports_only_changed_fields() {
        let mut store = DocumentStore::new(doc(json!({"counter": 1, "items": []})));

        let changes = store.apply(doc(json!({"counter": 3, "items": []})).into());

        assert_eq!(changes.len(), 1);
        assert_eq!(changes.get("counter"), Some(&json!(3)));
        assert_eq!(store.get("counter"), Some(&json!(3)));
    }

    #[test]
    fn test_update_with_rebuilt_equal_values_is_empty() {
        let mut store = DocumentStore::new(doc(json!({"items": [{"id": 1}], "journal": "x"})));

        // Build brand-new values that are structurally identical
        let changes = store.apply(Mutation::update(|current| {
            let mut next = current.clone();
            next.insert("items".to_string(), json!([{"id": 1}]));
            next
        }));

        assert!(changes.is_empty());
    }

    #[test]
    fn test_update_dropping_a_field_reports_null() {
        let mut store = DocumentStore::new(doc(json!({"a": 1, "b": 2})));

        let changes = store.apply(Mutation::update(|current| {
            let mut next = current.clone();
            next.remove("b");
            next
        }));

        assert_eq!(changes.get("b"), Some(&Value::Null));
        assert!(store.get("b").is_none());
        assert_eq!(store.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_null_is_absent() {
        let mut store = DocumentStore::new(doc(json!({"a": 1})));

        assert!(store.apply(Mutation::set("missing", Value::Null)).is_empty());

        let changes = store.apply(Mutation::set("a", Value::Null));
        assert!(changes.contains("a"));
        assert!(store.document().is_empty());
    }

    #[test]
    fn test_nested_values_replaced_wholesale() {
        let mut store = DocumentStore::new(doc(json!({"panels": {"oracle": true, "dice": false}})));

        store.apply(Mutation::set("panels", json!({"oracle": false})));

        assert_eq!(store.get("panels"), Some(&json!({"oracle": false})));
    }

    #[test]
    fn test_merge_remote_respects_filter() {
        let mut store = DocumentStore::new(doc(json!({"counter": 1, "journal": "mine"})));

        let changes = store.merge_remote(
            doc(json!({"counter": 4, "journal": "theirs"})),
            |field| field != "journal",
        );

        assert_eq!(changes.len(), 1);
        assert_eq!(store.get("counter"), Some(&json!(4)));
        assert_eq!(store.get("journal"), Some(&json!("mine")));
    }

    #[test]
    fn test_prepend_capped() {
        let mut store = DocumentStore::new(doc(json!({"log": [3, 2, 1]})));

        store.apply(Mutation::prepend_capped("log", json!(4), 3));
        assert_eq!(store.get("log"), Some(&json!([4, 3, 2])));

        store.apply(Mutation::prepend_capped("fresh", json!("a"), 3));
        assert_eq!(store.get("fresh"), Some(&json!(["a"])));
    }
}
