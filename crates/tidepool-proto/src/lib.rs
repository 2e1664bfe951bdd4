//! Wire protocol for Tidepool presentation-model remoting.
//!
//! Everything that crosses the HTTP boundary lives here: stable ids for
//! beans, lists and controllers, the property value type, and the tagged
//! [`Command`] catalog. Keeping this in a dedicated crate lets the client
//! and server share one definition of the wire surface without pulling in
//! runtime code.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{CodecError, CommandCodec, JsonCodec};

/// Identity of a bean within one session. Allocated monotonically by the
/// owning model store and never reused while referenced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BeanId(pub u64);

/// Identity of an observable list within one session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ListId(pub u64);

/// Identity of a server-side controller within one session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ControllerId(pub u64);

impl fmt::Display for BeanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bean:{}", self.0)
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "list:{}", self.0)
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "controller:{}", self.0)
    }
}

/// A property value slot. `BeanRef` and `ListRef` are the edges the
/// reachability collector follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PmValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    BeanRef(BeanId),
    ListRef(ListId),
}

impl PmValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PmValue::Null)
    }

    /// The bean this value points at, if it is a reference.
    pub fn bean_ref(&self) -> Option<BeanId> {
        match self {
            PmValue::BeanRef(id) => Some(*id),
            _ => None,
        }
    }

    pub fn list_ref(&self) -> Option<ListId> {
        match self {
            PmValue::ListRef(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<bool> for PmValue {
    fn from(value: bool) -> Self {
        PmValue::Bool(value)
    }
}

impl From<i64> for PmValue {
    fn from(value: i64) -> Self {
        PmValue::Int(value)
    }
}

impl From<f64> for PmValue {
    fn from(value: f64) -> Self {
        PmValue::Float(value)
    }
}

impl From<&str> for PmValue {
    fn from(value: &str) -> Self {
        PmValue::Text(value.to_string())
    }
}

impl From<String> for PmValue {
    fn from(value: String) -> Self {
        PmValue::Text(value)
    }
}

/// Action and controller parameters; a `BTreeMap` keeps the wire encoding
/// stable across round trips.
pub type Params = BTreeMap<String, PmValue>;

/// A single wire-level mutation or control instruction.
///
/// The batch a client POSTs is an ordered array of these; the response body
/// is another. Absence of a command is the only collection signal: the
/// server never emits a delete for a garbage-collected bean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ValueChanged {
        bean_id: BeanId,
        attribute: String,
        old_value: PmValue,
        new_value: PmValue,
    },
    ListAdd {
        list_id: ListId,
        index: usize,
        values: Vec<PmValue>,
    },
    ListRemove {
        list_id: ListId,
        index: usize,
        count: usize,
    },
    ListReplace {
        list_id: ListId,
        index: usize,
        values: Vec<PmValue>,
    },
    CreateContext,
    DestroyContext,
    CreateController {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<ControllerId>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: Params,
    },
    DestroyController {
        controller_id: ControllerId,
    },
    CallAction {
        controller_id: ControllerId,
        action_name: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: Params,
    },
    StartLongPoll,
    InterruptLongPoll,
}

/// Fieldless discriminant used by the server's handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ValueChanged,
    ListAdd,
    ListRemove,
    ListReplace,
    CreateContext,
    DestroyContext,
    CreateController,
    DestroyController,
    CallAction,
    StartLongPoll,
    InterruptLongPoll,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ValueChanged { .. } => CommandKind::ValueChanged,
            Command::ListAdd { .. } => CommandKind::ListAdd,
            Command::ListRemove { .. } => CommandKind::ListRemove,
            Command::ListReplace { .. } => CommandKind::ListReplace,
            Command::CreateContext => CommandKind::CreateContext,
            Command::DestroyContext => CommandKind::DestroyContext,
            Command::CreateController { .. } => CommandKind::CreateController,
            Command::DestroyController { .. } => CommandKind::DestroyController,
            Command::CallAction { .. } => CommandKind::CallAction,
            Command::StartLongPoll => CommandKind::StartLongPoll,
            Command::InterruptLongPoll => CommandKind::InterruptLongPoll,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::ValueChanged => "value_changed",
            CommandKind::ListAdd => "list_add",
            CommandKind::ListRemove => "list_remove",
            CommandKind::ListReplace => "list_replace",
            CommandKind::CreateContext => "create_context",
            CommandKind::DestroyContext => "destroy_context",
            CommandKind::CreateController => "create_controller",
            CommandKind::DestroyController => "destroy_controller",
            CommandKind::CallAction => "call_action",
            CommandKind::StartLongPoll => "start_long_poll",
            CommandKind::InterruptLongPoll => "interrupt_long_poll",
        };
        f.write_str(name)
    }
}
