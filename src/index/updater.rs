use std::collections::BTreeMap;

use log::{debug, warn};

use crate::{
    error::Result,
    schema::{FieldSet, FieldValues, Record},
    value::{are_equals, Value},
};

use super::Index;

/// The indexes of one entity, kept in step with every record mutation.
///
/// Update and delete take the record's previous field state from the caller, so the item
/// to relocate is found in its old bucket without a scan. A scan of every bucket is only
/// the fallback when the old bucket does not hold the item.
#[derive(Debug)]
pub struct IndexUpdater {
    entity: String,
    indexes: BTreeMap<String, Index>,
}

impl IndexUpdater {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            indexes: BTreeMap::new(),
        }
    }

    /// Starts maintaining `index`. An index already registered under the same name is
    /// returned.
    pub fn register(&mut self, index: Index) -> Option<Index> {
        self.indexes.insert(index.name().to_string(), index)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &Index> {
        self.indexes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Adds each record to every index.
    pub fn add_to_indexes<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> Result<()> {
        for record in records {
            for index in self.indexes.values_mut() {
                let (value, item) = index.item_for(&record.key, &record.fields);
                index.add(value, item)?;
            }
        }
        Ok(())
    }

    /// Moves the record `key` from its `old` state to its `new` one in every index that
    /// watches a changed field. A record whose indexed value is unchanged keeps its
    /// position in the bucket and only has its included values refreshed.
    pub fn update_indexes(
        &mut self,
        key: &Value,
        old: &FieldValues,
        new: &FieldValues,
    ) -> Result<()> {
        let changed = changed_fields(old, new);
        if changed.is_empty() {
            return Ok(());
        }

        for index in self.indexes.values_mut() {
            if !index.metadata().watched_fields().intersects(&changed) {
                continue;
            }

            let field_number = index.metadata().field_number;
            let old_value = old.get(&field_number).cloned().unwrap_or(Value::Null);
            let (new_value, item) = index.item_for(key, new);

            if are_equals(&old_value, &new_value)
                && index.refresh_item(&old_value, key, item.included_fields.clone())
            {
                continue;
            }

            if index.remove_item(&old_value, key).is_none() {
                warn!(
                    "{}.{}: {} not found under {}, scanning all buckets",
                    self.entity,
                    index.name(),
                    key,
                    old_value
                );
                if let Some(actual) = index.find_bucket_of(key) {
                    index.remove_item(&actual, key);
                }
            }
            debug!(
                "{}.{}: moving {} from {} to {}",
                self.entity,
                index.name(),
                key,
                old_value,
                new_value
            );
            index.add(new_value, item)?;
        }
        Ok(())
    }

    /// Removes the record `key` from every index. Without the `old` state the item is
    /// searched for in every bucket.
    pub fn delete_from_indexes(&mut self, key: &Value, old: Option<&FieldValues>) {
        for index in self.indexes.values_mut() {
            let bucket = match old {
                Some(fields) => fields
                    .get(&index.metadata().field_number)
                    .cloned()
                    .unwrap_or(Value::Null),
                None => match index.find_bucket_of(key) {
                    Some(bucket) => bucket,
                    None => continue,
                },
            };

            if index.remove_item(&bucket, key).is_some() {
                continue;
            }
            match index.find_bucket_of(key) {
                Some(actual) => {
                    warn!(
                        "{}.{}: {} was under {} instead of {}",
                        self.entity,
                        index.name(),
                        key,
                        actual,
                        bucket
                    );
                    index.remove_item(&actual, key);
                }
                None => warn!("{}.{}: {} was not indexed", self.entity, index.name(), key),
            }
        }
    }
}

/// Field numbers whose value differs between `old` and `new`, absent counting as `Null`.
pub(crate) fn changed_fields(old: &FieldValues, new: &FieldValues) -> FieldSet {
    let null = Value::Null;
    old.keys()
        .chain(new.keys())
        .copied()
        .filter(|number| {
            let before = old.get(number).unwrap_or(&null);
            let after = new.get(number).unwrap_or(&null);
            !are_equals(before, after)
        })
        .collect()
}

/// `old` with `changes` applied; `Null` changes remove the field.
pub(crate) fn merge_fields(old: &FieldValues, changes: &FieldValues) -> FieldValues {
    let mut merged = old.clone();
    for (&number, value) in changes {
        if value.is_null() {
            merged.remove(&number);
        } else {
            merged.insert(number, value.clone());
        }
    }
    merged
}
