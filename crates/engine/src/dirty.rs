// Dirty field tracking
//
// A field is dirty from the moment a local mutation changes it until a
// durable flush that carried its current value succeeds. Reconciliation
// never overwrites a dirty field.

use std::collections::HashMap;

/// Set of fields holding unconfirmed local edits.
///
/// Every `mark_dirty` bumps the field's generation, so a flush can clear
/// exactly the edits it carried and nothing that arrived after it started.
#[derive(Debug, Default)]
pub struct DirtySet {
    entries: HashMap<String, u64>,
    next_generation: u64,
}

/// Fields and generations captured when a flush serialized the document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtySnapshot {
    entries: Vec<(String, u64)>,
}

impl DirtySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(field, _)| field.as_str())
    }
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            self.next_generation += 1;
            self.entries.insert(field.into(), self.next_generation);
        }
    }

    pub fn is_dirty(&self, field: &str) -> bool {
        self.entries.contains_key(field)
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dirty field names, sorted
    pub fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.entries.keys().cloned().collect();
        fields.sort();
        fields
    }

    pub fn snapshot(&self) -> DirtySnapshot {
        DirtySnapshot {
            entries: self
                .entries
                .iter()
                .map(|(field, generation)| (field.clone(), *generation))
                .collect(),
        }
    }

    /// Clear the fields a successful flush carried.
    ///
    /// A field re-dirtied after the snapshot keeps its entry. Returns how
    /// many fields were cleared.
    pub fn clear_confirmed(&mut self, snapshot: &DirtySnapshot) -> usize {
        let mut cleared = 0;
        for (field, generation) in &snapshot.entries {
            if self.entries.get(field) == Some(generation) {
                self.entries.remove(field);
                cleared += 1;
            }
        }
        cleared
    }
}
