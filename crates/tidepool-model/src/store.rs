use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use tidepool_proto::{BeanId, Command, ListId, PmValue};

use crate::{
    Bean, EventOrigin, ListChange, ModelChange, ModelError, ModelEvent, ObservableList,
};

pub type Listener = Box<dyn Fn(&ModelEvent) + Send + Sync>;

/// Beans and lists reachable from a set of root beans.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReachableSet {
    pub beans: HashSet<BeanId>,
    pub lists: HashSet<ListId>,
}

#[derive(Default)]
struct StoreInner {
    beans: HashMap<BeanId, Bean>,
    lists: HashMap<ListId, ObservableList>,
    next_id: u64,
}

impl StoreInner {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Keeps the allocator ahead of ids learned from the remote side so a
    /// later local allocation can never collide with an applied one.
    fn note_foreign_id(&mut self, raw: u64) {
        if raw >= self.next_id {
            self.next_id = raw + 1;
        }
    }
}

/// Arena of beans and observable lists keyed by id. Ids are allocated
/// monotonically and never reused while referenced. All mutations emit
/// [`ModelEvent`]s after the structural lock is released, tagged with the
/// origin of the change.
#[derive(Default)]
pub struct ModelStore {
    inner: Mutex<StoreInner>,
    listeners: RwLock<Vec<Listener>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    fn emit(&self, origin: EventOrigin, changes: Vec<ModelChange>) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.listeners.read();
        for change in changes {
            let event = ModelEvent { origin, change };
            for listener in listeners.iter() {
                listener(&event);
            }
        }
    }

    // --- beans ---------------------------------------------------------

    pub fn create_bean(&self) -> BeanId {
        let id = {
            let mut inner = self.inner.lock();
            let id = BeanId(inner.allocate());
            inner.beans.insert(id, Bean::new(id));
            id
        };
        self.emit(EventOrigin::Local, vec![ModelChange::BeanAdded { bean_id: id }]);
        id
    }

    /// Adds a fresh attribute slot. Emits a `ValueChanged` with a `Null`
    /// old value so the remote side materializes the slot on apply.
    pub fn add_property(
        &self,
        bean_id: BeanId,
        attribute: &str,
        value: PmValue,
    ) -> Result<(), ModelError> {
        {
            let mut inner = self.inner.lock();
            let bean = inner
                .beans
                .get_mut(&bean_id)
                .ok_or(ModelError::UnknownBean(bean_id))?;
            bean.add_property(attribute, value.clone())?;
        }
        self.emit(
            EventOrigin::Local,
            vec![ModelChange::ValueChanged {
                bean_id,
                attribute: attribute.to_string(),
                old_value: PmValue::Null,
                new_value: value,
            }],
        );
        Ok(())
    }

    /// Changes an existing attribute. Setting the current value again is a
    /// no-op and emits nothing.
    pub fn set_value(
        &self,
        bean_id: BeanId,
        attribute: &str,
        value: PmValue,
    ) -> Result<(), ModelError> {
        let old_value = {
            let mut inner = self.inner.lock();
            let bean = inner
                .beans
                .get_mut(&bean_id)
                .ok_or(ModelError::UnknownBean(bean_id))?;
            if bean.get(attribute) == Some(&value) {
                return Ok(());
            }
            bean.set(attribute, value.clone())?
        };
        self.emit(
            EventOrigin::Local,
            vec![ModelChange::ValueChanged {
                bean_id,
                attribute: attribute.to_string(),
                old_value,
                new_value: value,
            }],
        );
        Ok(())
    }

    pub fn value(&self, bean_id: BeanId, attribute: &str) -> Result<PmValue, ModelError> {
        let inner = self.inner.lock();
        let bean = inner
            .beans
            .get(&bean_id)
            .ok_or(ModelError::UnknownBean(bean_id))?;
        bean.get(attribute)
            .cloned()
            .ok_or_else(|| ModelError::UnknownAttribute {
                bean_id,
                attribute: attribute.to_string(),
            })
    }

    pub fn contains_bean(&self, bean_id: BeanId) -> bool {
        self.inner.lock().beans.contains_key(&bean_id)
    }

    pub fn bean_ids(&self) -> Vec<BeanId> {
        self.inner.lock().beans.keys().copied().collect()
    }

    pub fn snapshot_bean(&self, bean_id: BeanId) -> Option<Bean> {
        self.inner.lock().beans.get(&bean_id).cloned()
    }

    /// Frees the identity slot. The caller (GC or explicit destroy) is
    /// responsible for having proven the bean unreachable; no command is
    /// ever derived from this event.
    pub fn remove_bean(&self, bean_id: BeanId) -> Result<(), ModelError> {
        {
            let mut inner = self.inner.lock();
            inner
                .beans
                .remove(&bean_id)
                .ok_or(ModelError::UnknownBean(bean_id))?;
        }
        self.emit(
            EventOrigin::Local,
            vec![ModelChange::BeanRemoved { bean_id }],
        );
        Ok(())
    }

    // --- lists ---------------------------------------------------------

    pub fn create_list(&self) -> ListId {
        let id = {
            let mut inner = self.inner.lock();
            let id = ListId(inner.allocate());
            inner.lists.insert(id, ObservableList::new(id));
            id
        };
        self.emit(EventOrigin::Local, vec![ModelChange::ListAdded { list_id: id }]);
        id
    }

    pub fn list_insert(
        &self,
        list_id: ListId,
        index: usize,
        values: Vec<PmValue>,
    ) -> Result<(), ModelError> {
        self.mutate_list(EventOrigin::Local, list_id, ListChange::Added { index, values })
    }

    pub fn list_remove(
        &self,
        list_id: ListId,
        index: usize,
        count: usize,
    ) -> Result<(), ModelError> {
        self.mutate_list(EventOrigin::Local, list_id, ListChange::Removed { index, count })
    }

    pub fn list_replace(
        &self,
        list_id: ListId,
        index: usize,
        values: Vec<PmValue>,
    ) -> Result<(), ModelError> {
        self.mutate_list(
            EventOrigin::Local,
            list_id,
            ListChange::Replaced { index, values },
        )
    }

    pub fn list_items(&self, list_id: ListId) -> Result<Vec<PmValue>, ModelError> {
        let inner = self.inner.lock();
        let list = inner
            .lists
            .get(&list_id)
            .ok_or(ModelError::UnknownList(list_id))?;
        Ok(list.items().to_vec())
    }

    pub fn contains_list(&self, list_id: ListId) -> bool {
        self.inner.lock().lists.contains_key(&list_id)
    }

    pub fn list_ids(&self) -> Vec<ListId> {
        self.inner.lock().lists.keys().copied().collect()
    }

    pub fn remove_list(&self, list_id: ListId) -> Result<(), ModelError> {
        {
            let mut inner = self.inner.lock();
            inner
                .lists
                .remove(&list_id)
                .ok_or(ModelError::UnknownList(list_id))?;
        }
        self.emit(
            EventOrigin::Local,
            vec![ModelChange::ListRemoved { list_id }],
        );
        Ok(())
    }

    fn mutate_list(
        &self,
        origin: EventOrigin,
        list_id: ListId,
        change: ListChange,
    ) -> Result<(), ModelError> {
        {
            let mut inner = self.inner.lock();
            let list = inner
                .lists
                .get_mut(&list_id)
                .ok_or(ModelError::UnknownList(list_id))?;
            match &change {
                ListChange::Added { index, values } => list.insert(*index, values)?,
                ListChange::Removed { index, count } => {
                    list.remove(*index, *count)?;
                }
                ListChange::Replaced { index, values } => list.replace(*index, values)?,
            }
        }
        self.emit(origin, vec![ModelChange::ListChanged { list_id, change }]);
        Ok(())
    }

    // --- remote apply --------------------------------------------------

    /// Applies a graph-mutation command received from the other side.
    /// Beans, lists and attribute slots are created on demand: command
    /// absence is the only deletion signal, so the first mention of an id
    /// is its creation. Events carry `Remote` origin and are therefore not
    /// forwarded back onto the wire.
    pub fn apply(&self, command: &Command) -> Result<(), ModelError> {
        match command {
            Command::ValueChanged {
                bean_id,
                attribute,
                new_value,
                ..
            } => {
                let (old_value, created) = {
                    let mut inner = self.inner.lock();
                    inner.note_foreign_id(bean_id.0);
                    let created = !inner.beans.contains_key(bean_id);
                    let bean = inner
                        .beans
                        .entry(*bean_id)
                        .or_insert_with(|| Bean::new(*bean_id));
                    (bean.set_or_insert(attribute, new_value.clone()), created)
                };
                let mut changes = Vec::with_capacity(2);
                if created {
                    changes.push(ModelChange::BeanAdded { bean_id: *bean_id });
                }
                if old_value != *new_value {
                    changes.push(ModelChange::ValueChanged {
                        bean_id: *bean_id,
                        attribute: attribute.clone(),
                        old_value,
                        new_value: new_value.clone(),
                    });
                }
                self.emit(EventOrigin::Remote, changes);
                Ok(())
            }
            Command::ListAdd {
                list_id,
                index,
                values,
            } => {
                let created = {
                    let mut inner = self.inner.lock();
                    inner.note_foreign_id(list_id.0);
                    let created = !inner.lists.contains_key(list_id);
                    inner
                        .lists
                        .entry(*list_id)
                        .or_insert_with(|| ObservableList::new(*list_id));
                    created
                };
                if created {
                    debug!(list_id = %list_id, "materialized list on first remote mention");
                    self.emit(
                        EventOrigin::Remote,
                        vec![ModelChange::ListAdded { list_id: *list_id }],
                    );
                }
                self.mutate_list(
                    EventOrigin::Remote,
                    *list_id,
                    ListChange::Added {
                        index: *index,
                        values: values.clone(),
                    },
                )
            }
            Command::ListRemove {
                list_id,
                index,
                count,
            } => self.mutate_list(
                EventOrigin::Remote,
                *list_id,
                ListChange::Removed {
                    index: *index,
                    count: *count,
                },
            ),
            Command::ListReplace {
                list_id,
                index,
                values,
            } => self.mutate_list(
                EventOrigin::Remote,
                *list_id,
                ListChange::Replaced {
                    index: *index,
                    values: values.clone(),
                },
            ),
            other => {
                debug!(kind = %other.kind(), "ignoring non-graph command in model apply");
                Ok(())
            }
        }
    }

    // --- reachability --------------------------------------------------

    /// Breadth-first reachability from `roots` across `BeanRef`/`ListRef`
    /// edges, computed start-to-finish under the structural lock so a
    /// concurrent mutation can never produce a half-marked graph.
    pub fn reachable(&self, roots: &[BeanId]) -> ReachableSet {
        self.reachable_from(roots, &[])
    }

    /// Reachability seeded from both bean and list roots.
    pub fn reachable_from(&self, bean_roots: &[BeanId], list_roots: &[ListId]) -> ReachableSet {
        let inner = self.inner.lock();
        inner.reachable_from(bean_roots, list_roots)
    }

    /// Drops every bean and list not reachable from the given roots. The
    /// client-side counterpart of the server sweep: no command is derived
    /// from the removals, the graphs converge because both sides prune the
    /// same unreferenced instances on their own.
    pub fn retain_reachable(&self, bean_roots: &[BeanId], list_roots: &[ListId]) -> usize {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            let kept = inner.reachable_from(bean_roots, list_roots);
            let doomed_beans: Vec<BeanId> = inner
                .beans
                .keys()
                .filter(|bean_id| !kept.beans.contains(bean_id))
                .copied()
                .collect();
            let doomed_lists: Vec<ListId> = inner
                .lists
                .keys()
                .filter(|list_id| !kept.lists.contains(list_id))
                .copied()
                .collect();
            for bean_id in doomed_beans {
                inner.beans.remove(&bean_id);
                changes.push(ModelChange::BeanRemoved { bean_id });
            }
            for list_id in doomed_lists {
                inner.lists.remove(&list_id);
                changes.push(ModelChange::ListRemoved { list_id });
            }
        }
        let removed = changes.len();
        self.emit(EventOrigin::Local, changes);
        removed
    }
}

impl StoreInner {
    fn reachable_from(&self, bean_roots: &[BeanId], list_roots: &[ListId]) -> ReachableSet {
        let mut set = ReachableSet::default();
        let mut queue: VecDeque<PmValue> = bean_roots
            .iter()
            .copied()
            .map(PmValue::BeanRef)
            .chain(list_roots.iter().copied().map(PmValue::ListRef))
            .collect();

        while let Some(value) = queue.pop_front() {
            match value {
                PmValue::BeanRef(bean_id) => {
                    if !set.beans.insert(bean_id) {
                        continue;
                    }
                    if let Some(bean) = self.beans.get(&bean_id) {
                        for property in bean.properties() {
                            queue.push_back(property.value().clone());
                        }
                    }
                }
                PmValue::ListRef(list_id) => {
                    if !set.lists.insert(list_id) {
                        continue;
                    }
                    if let Some(list) = self.lists.get(&list_id) {
                        for item in list.items() {
                            queue.push_back(item.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        set
    }
}
