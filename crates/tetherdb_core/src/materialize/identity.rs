//! Per-call identity caches.
//!
//! Both caches live for one materializer call (or one bulk call) and are
//! dropped with it.

use crate::object::{Object, ObjectId};
use crate::types::RowId;
use std::collections::HashMap;

/// Detached object identity to the row it was copied into.
#[derive(Default)]
pub(crate) struct CopyInCache {
    rows: HashMap<ObjectId, RowId>,
    // Keeps every visited source alive so its identity cannot be reused
    // by a new allocation during the call.
    pinned: Vec<Object>,
}

impl CopyInCache {
    pub(crate) fn get(&self, source: &Object) -> Option<RowId> {
        self.rows.get(&source.identity()).copied()
    }

    pub(crate) fn insert(&mut self, source: &Object, row: RowId) {
        self.rows.insert(source.identity(), row);
        self.pinned.push(source.clone());
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }
}

/// A detached copy and the depth budget it was filled with.
struct Extracted {
    object: Object,
    remaining: i32,
}

/// What to do with a row reached during copy-out.
pub(crate) enum Visit {
    /// Already filled with at least this budget.
    Done(Object),
    /// Fill this object, new or previously filled with a smaller budget.
    Fill(Object),
}

/// `(table, row)` to its detached copy.
#[derive(Default)]
pub(crate) struct CopyOutCache {
    objects: HashMap<(String, RowId), Extracted>,
}

impl CopyOutCache {
    /// Looks up `(table, row)` for a visit with `remaining` depth budget,
    /// registering a fresh object of `class_name` on first sight.
    pub(crate) fn visit(&mut self, table: &str, row: RowId, class_name: &str, remaining: i32) -> Visit {
        match self.objects.get_mut(&(table.to_string(), row)) {
            Some(entry) if entry.remaining >= remaining => Visit::Done(entry.object.clone()),
            Some(entry) => {
                entry.remaining = remaining;
                Visit::Fill(entry.object.clone())
            }
            None => {
                let object = Object::new(class_name);
                self.objects.insert(
                    (table.to_string(), row),
                    Extracted {
                        object: object.clone(),
                        remaining,
                    },
                );
                Visit::Fill(object)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_in_is_keyed_by_identity() {
        let mut cache = CopyInCache::default();
        let a = Object::new("Person").with("id", 1);
        let twin = Object::new("Person").with("id", 1);
        cache.insert(&a, RowId(4));
        assert_eq!(cache.get(&a.clone()), Some(RowId(4)));
        assert_eq!(cache.get(&twin), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn copy_out_refills_for_larger_budgets() {
        let mut cache = CopyOutCache::default();
        let Visit::Fill(first) = cache.visit("class_Person", RowId(1), "Person", 1) else {
            panic!("first visit must fill");
        };
        let Visit::Done(again) = cache.visit("class_Person", RowId(1), "Person", 0) else {
            panic!("smaller budget must reuse");
        };
        assert!(first.ptr_eq(&again));
        let Visit::Fill(refill) = cache.visit("class_Person", RowId(1), "Person", 3) else {
            panic!("larger budget must refill");
        };
        assert!(first.ptr_eq(&refill));
    }
}
