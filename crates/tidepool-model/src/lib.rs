//! The presentation-model graph: beans, properties and observable lists,
//! identified by stable ids and shared between client and server. Both
//! sides hold a [`ModelStore`] and keep them consistent by exchanging
//! commands; the store emits [`ModelEvent`]s so the surrounding transport
//! can translate local mutations into outgoing commands without echoing
//! remote applies back.

use thiserror::Error;

use tidepool_proto::{BeanId, Command, ListId, PmValue};

mod bean;
mod list;
mod store;

pub use bean::{Bean, Property};
pub use list::ObservableList;
pub use store::{Listener, ModelStore, ReachableSet};

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("unknown bean {0}")]
    UnknownBean(BeanId),
    #[error("unknown list {0}")]
    UnknownList(ListId),
    #[error("bean {bean_id} has no attribute \"{attribute}\"")]
    UnknownAttribute { bean_id: BeanId, attribute: String },
    #[error("bean {bean_id} already has attribute \"{attribute}\"")]
    DuplicateAttribute { bean_id: BeanId, attribute: String },
    #[error("index {index} out of bounds for list {list_id} of length {len}")]
    IndexOutOfBounds {
        list_id: ListId,
        index: usize,
        len: usize,
    },
}

/// Who triggered a mutation. Listeners that forward local edits onto the
/// wire skip `Remote` events, otherwise every applied command would echo
/// straight back to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Local,
    Remote,
}

/// A structural change to an observable list.
#[derive(Debug, Clone, PartialEq)]
pub enum ListChange {
    Added { index: usize, values: Vec<PmValue> },
    Removed { index: usize, count: usize },
    Replaced { index: usize, values: Vec<PmValue> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChange {
    ValueChanged {
        bean_id: BeanId,
        attribute: String,
        old_value: PmValue,
        new_value: PmValue,
    },
    ListChanged {
        list_id: ListId,
        change: ListChange,
    },
    BeanAdded {
        bean_id: BeanId,
    },
    BeanRemoved {
        bean_id: BeanId,
    },
    ListAdded {
        list_id: ListId,
    },
    ListRemoved {
        list_id: ListId,
    },
}

impl ModelChange {
    /// The wire form of a graph mutation. Structural add/remove changes
    /// have none of their own: attribute materialization rides on
    /// `ValueChanged`, and command absence is the only deletion signal.
    pub fn as_command(&self) -> Option<Command> {
        match self {
            ModelChange::ValueChanged {
                bean_id,
                attribute,
                old_value,
                new_value,
            } => Some(Command::ValueChanged {
                bean_id: *bean_id,
                attribute: attribute.clone(),
                old_value: old_value.clone(),
                new_value: new_value.clone(),
            }),
            ModelChange::ListChanged { list_id, change } => Some(match change {
                ListChange::Added { index, values } => Command::ListAdd {
                    list_id: *list_id,
                    index: *index,
                    values: values.clone(),
                },
                ListChange::Removed { index, count } => Command::ListRemove {
                    list_id: *list_id,
                    index: *index,
                    count: *count,
                },
                ListChange::Replaced { index, values } => Command::ListReplace {
                    list_id: *list_id,
                    index: *index,
                    values: values.clone(),
                },
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelEvent {
    pub origin: EventOrigin,
    pub change: ModelChange,
}
