//! A small counter controller used to exercise the session engine from
//! the outside: a root bean with a `count` attribute plus one child bean
//! hanging off a `BeanRef` edge.

use tidepool_model::{ModelError, ModelStore};
use tidepool_proto::{BeanId, Params, PmValue};
use tidepool_server::{Controller, ControllerError, ControllerFactory};

fn model_err(err: ModelError) -> ControllerError {
    ControllerError::Action(err.to_string())
}

pub struct CounterController {
    root: BeanId,
}

impl Controller for CounterController {
    fn model_root(&self) -> BeanId {
        self.root
    }

    fn call_action(
        &mut self,
        action: &str,
        _params: &Params,
        store: &ModelStore,
    ) -> Result<(), ControllerError> {
        match action {
            "increment" => {
                let current = match store.value(self.root, "count") {
                    Ok(PmValue::Int(n)) => n,
                    _ => 0,
                };
                store
                    .set_value(self.root, "count", PmValue::Int(current + 1))
                    .map_err(model_err)
            }
            "fail" => Err(ControllerError::Action("boom".into())),
            other => Err(ControllerError::UnknownAction(other.to_string())),
        }
    }
}

pub struct CounterFactory;

impl ControllerFactory for CounterFactory {
    fn create(
        &self,
        name: &str,
        _params: &Params,
        store: &ModelStore,
    ) -> Result<Box<dyn Controller>, ControllerError> {
        if name != "counter" {
            return Err(ControllerError::UnknownType(name.to_string()));
        }
        let root = store.create_bean();
        let child = store.create_bean();
        store
            .add_property(root, "count", PmValue::Int(0))
            .map_err(model_err)?;
        store
            .add_property(child, "label", PmValue::Text("counter".into()))
            .map_err(model_err)?;
        store
            .add_property(root, "child", PmValue::BeanRef(child))
            .map_err(model_err)?;
        Ok(Box::new(CounterController { root }))
    }
}
