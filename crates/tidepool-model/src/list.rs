use tidepool_proto::{ListId, PmValue};

use crate::ModelError;

/// An ordered sequence of values with structural change tracking. The store
/// wraps every mutation in a [`crate::ListChange`] event; the list itself
/// only validates indices and applies the edit.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableList {
    id: ListId,
    items: Vec<PmValue>,
}

impl ObservableList {
    pub fn new(id: ListId) -> Self {
        Self {
            id,
            items: Vec::new(),
        }
    }

    pub fn id(&self) -> ListId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PmValue> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[PmValue] {
        &self.items
    }

    /// Insert `values` starting at `index`; `index == len` appends.
    pub(crate) fn insert(&mut self, index: usize, values: &[PmValue]) -> Result<(), ModelError> {
        if index > self.items.len() {
            return Err(self.out_of_bounds(index));
        }
        self.items.splice(index..index, values.iter().cloned());
        Ok(())
    }

    /// Remove `count` elements starting at `index`.
    pub(crate) fn remove(&mut self, index: usize, count: usize) -> Result<Vec<PmValue>, ModelError> {
        let end = index
            .checked_add(count)
            .filter(|end| *end <= self.items.len())
            .ok_or_else(|| self.out_of_bounds(index))?;
        Ok(self.items.drain(index..end).collect())
    }

    /// Overwrite `values.len()` elements in place starting at `index`.
    pub(crate) fn replace(&mut self, index: usize, values: &[PmValue]) -> Result<(), ModelError> {
        let end = index
            .checked_add(values.len())
            .filter(|end| *end <= self.items.len())
            .ok_or_else(|| self.out_of_bounds(index))?;
        self.items[index..end].clone_from_slice(values);
        Ok(())
    }

    fn out_of_bounds(&self, index: usize) -> ModelError {
        ModelError::IndexOutOfBounds {
            list_id: self.id,
            index,
            len: self.items.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<PmValue> {
        values.iter().copied().map(PmValue::Int).collect()
    }

    #[test]
    fn insert_remove_replace() {
        let mut list = ObservableList::new(ListId(1));
        list.insert(0, &ints(&[1, 2, 3])).expect("insert");
        list.insert(1, &ints(&[9])).expect("insert middle");
        assert_eq!(list.items(), ints(&[1, 9, 2, 3]).as_slice());

        let removed = list.remove(1, 2).expect("remove");
        assert_eq!(removed, ints(&[9, 2]));
        assert_eq!(list.items(), ints(&[1, 3]).as_slice());

        list.replace(1, &ints(&[7])).expect("replace");
        assert_eq!(list.items(), ints(&[1, 7]).as_slice());
    }

    #[test]
    fn bounds_are_checked() {
        let mut list = ObservableList::new(ListId(2));
        list.insert(0, &ints(&[1])).expect("insert");
        assert!(list.insert(5, &ints(&[2])).is_err());
        assert!(list.remove(0, 2).is_err());
        assert!(list.replace(1, &ints(&[2])).is_err());
    }
}
