//! Reachability sweep over the live presentation-model graph. Runs once
//! per long-poll cycle against the session's store: mark from the active
//! controller roots, then sweep every instance that is neither reached nor
//! explicitly held. No command is ever emitted for a collected bean; the
//! client drops its own unreferenced copies independently.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use tidepool_model::ModelStore;
use tidepool_proto::BeanId;

/// GC-tracked wrapper around a bean.
#[derive(Debug)]
pub struct Instance {
    pub bean_id: BeanId,
    pub marked: bool,
    /// Held instances survive even when unreachable (platform beans).
    pub held: bool,
}

#[derive(Default)]
pub struct InstanceArena {
    instances: HashMap<BeanId, Instance>,
}

impl InstanceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&mut self, bean_id: BeanId) {
        self.instances
            .entry(bean_id)
            .or_insert_with(|| Instance {
                bean_id,
                marked: false,
                held: false,
            })
            .held = true;
    }

    pub fn release(&mut self, bean_id: BeanId) {
        if let Some(instance) = self.instances.get_mut(&bean_id) {
            instance.held = false;
        }
    }

    pub fn is_held(&self, bean_id: BeanId) -> bool {
        self.instances
            .get(&bean_id)
            .map(|instance| instance.held)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Brings the arena in line with the store: track beans that appeared
    /// since the last cycle, forget ids whose slot was already freed.
    fn sync(&mut self, bean_ids: &[BeanId]) {
        for bean_id in bean_ids {
            self.instances.entry(*bean_id).or_insert_with(|| Instance {
                bean_id: *bean_id,
                marked: false,
                held: false,
            });
        }
        self.instances
            .retain(|bean_id, _| bean_ids.contains(bean_id));
    }
}

/// Per-instance veto: the bean repository may refuse a collection (for
/// example while the bean is still in flight for an unacknowledged
/// command). Vetoed instances are retried next cycle; a veto is an
/// expected path, never an error.
pub trait CollectionVeto: Send + Sync {
    fn reject(&self, bean_id: BeanId) -> bool;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub collected: usize,
    pub lists_collected: usize,
    pub vetoed: usize,
    pub retained: usize,
}

#[derive(Default)]
pub struct GarbageCollector {
    veto: Option<Arc<dyn CollectionVeto>>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_veto(veto: Arc<dyn CollectionVeto>) -> Self {
        Self { veto: Some(veto) }
    }

    /// One mark/sweep cycle. The caller holds the session's active guard,
    /// so the graph cannot mutate while reachability is recomputed.
    pub fn collect(
        &self,
        store: &ModelStore,
        arena: &mut InstanceArena,
        roots: &[BeanId],
    ) -> GcStats {
        arena.sync(&store.bean_ids());
        let reachable = store.reachable(roots);

        let mut stats = GcStats::default();
        let mut doomed = Vec::new();
        for instance in arena.instances.values_mut() {
            instance.marked = reachable.beans.contains(&instance.bean_id);
            if !instance.marked && !instance.held {
                doomed.push(instance.bean_id);
            }
        }

        for bean_id in doomed {
            if let Some(veto) = &self.veto {
                if veto.reject(bean_id) {
                    stats.vetoed += 1;
                    continue;
                }
            }
            if let Err(err) = store.remove_bean(bean_id) {
                warn!(bean_id = %bean_id, error = %err, "gc sweep lost a bean slot");
                continue;
            }
            arena.instances.remove(&bean_id);
            stats.collected += 1;
        }

        // Lists survive as long as any surviving bean (reachable, held or
        // vetoed) still references them.
        let survivors: Vec<BeanId> = arena.instances.keys().copied().collect();
        let kept = store.reachable(&survivors);
        for list_id in store.list_ids() {
            if !kept.lists.contains(&list_id) {
                if store.remove_list(list_id).is_ok() {
                    stats.lists_collected += 1;
                }
            }
        }

        stats.retained = arena.len();
        stats
    }
}
