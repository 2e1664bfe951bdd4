//! Collaborator seams consumed by the session engine. Applications plug in
//! controllers through these traits; the engine only ever sees the
//! contracts.

use thiserror::Error;

use tidepool_model::ModelStore;
use tidepool_proto::{BeanId, Params};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown controller type \"{0}\"")]
    UnknownType(String),
    #[error("no such action \"{0}\"")]
    UnknownAction(String),
    #[error("action failed: {0}")]
    Action(String),
}

/// A server-side controller bound to one presentation-model root. Created
/// on `CreateController`, torn down by the explicit `destroy` call at
/// controller-destroy or session-end time, never by drop-order accident.
pub trait Controller: Send {
    /// The GC root bean of this controller's model.
    fn model_root(&self) -> BeanId;

    /// Invoked for `CallAction`. Errors are caught by the dispatcher and
    /// recorded as an in-graph error flag; they never fail the enclosing
    /// batch.
    fn call_action(
        &mut self,
        action: &str,
        params: &Params,
        store: &ModelStore,
    ) -> Result<(), ControllerError>;

    /// Explicit teardown hook; the model beans become unreachable and are
    /// collected by the next GC cycle.
    fn destroy(&mut self, _store: &ModelStore) {}
}

/// Managed-bean factory instantiating controllers by name.
pub trait ControllerFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        params: &Params,
        store: &ModelStore,
    ) -> Result<Box<dyn Controller>, ControllerError>;
}

/// Factory that knows no controller types. Default for deployments that
/// drive the graph purely through value and list commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyControllerFactory;

impl ControllerFactory for EmptyControllerFactory {
    fn create(
        &self,
        name: &str,
        _params: &Params,
        _store: &ModelStore,
    ) -> Result<Box<dyn Controller>, ControllerError> {
        Err(ControllerError::UnknownType(name.to_string()))
    }
}
