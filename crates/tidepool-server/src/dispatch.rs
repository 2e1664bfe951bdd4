//! Discriminator → handler dispatch for one session's command batches.
//! Variants are wired up by explicit registration so collaborators can add
//! handlers without touching the engine.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tracing::warn;

use tidepool_proto::{Command, CommandKind};

use crate::contract::{ControllerError, ControllerFactory};
use crate::session::{ControllerEntry, SessionError, SessionState};

/// Everything a handler may touch, borrowed for the duration of one
/// dispatched command under the session's active guard.
pub struct SessionContext<'a> {
    pub state: &'a mut SessionState,
    pub factory: &'a dyn ControllerFactory,
}

pub type Handler =
    Box<dyn Fn(&mut SessionContext<'_>, Command) -> Result<(), SessionError> + Send + Sync>;

pub struct CommandDispatcher {
    handlers: HashMap<CommandKind, Handler>,
}

impl CommandDispatcher {
    /// A dispatcher with no handlers; callers register everything.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The standard table: graph mutations, context lifecycle and the
    /// controller commands. Long-poll control commands are intercepted at
    /// the batch level and never reach the table.
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        for kind in [
            CommandKind::ValueChanged,
            CommandKind::ListAdd,
            CommandKind::ListRemove,
            CommandKind::ListReplace,
        ] {
            dispatcher.register(kind, Box::new(handle_graph_mutation));
        }
        dispatcher.register(CommandKind::CreateContext, Box::new(handle_create_context));
        dispatcher.register(CommandKind::DestroyContext, Box::new(handle_destroy_context));
        dispatcher.register(
            CommandKind::CreateController,
            Box::new(handle_create_controller),
        );
        dispatcher.register(
            CommandKind::DestroyController,
            Box::new(handle_destroy_controller),
        );
        dispatcher.register(CommandKind::CallAction, Box::new(handle_call_action));
        dispatcher
    }

    pub fn register(
        &mut self,
        kind: CommandKind,
        handler: impl Fn(&mut SessionContext<'_>, Command) -> Result<(), SessionError>
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers.insert(kind, Box::new(handler));
    }

    pub fn dispatch(
        &self,
        ctx: &mut SessionContext<'_>,
        command: Command,
    ) -> Result<(), SessionError> {
        let kind = command.kind();
        match self.handlers.get(&kind) {
            Some(handler) => handler(ctx, command),
            None => Err(SessionError::Unhandled(kind)),
        }
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn handle_graph_mutation(
    ctx: &mut SessionContext<'_>,
    command: Command,
) -> Result<(), SessionError> {
    ctx.state.store.apply(&command)?;
    Ok(())
}

fn handle_create_context(
    ctx: &mut SessionContext<'_>,
    _command: Command,
) -> Result<(), SessionError> {
    ctx.state.init_context();
    Ok(())
}

fn handle_destroy_context(
    ctx: &mut SessionContext<'_>,
    _command: Command,
) -> Result<(), SessionError> {
    ctx.state.destroy_all_controllers();
    ctx.state.destroyed = true;
    Ok(())
}

fn handle_create_controller(
    ctx: &mut SessionContext<'_>,
    command: Command,
) -> Result<(), SessionError> {
    let Command::CreateController {
        name,
        parent_id,
        params,
    } = command
    else {
        return Err(SessionError::Unhandled(CommandKind::CreateController));
    };
    let store = Arc::clone(&ctx.state.store);
    let controller = ctx.factory.create(&name, &params, &store)?;
    let model_root = controller.model_root();
    let controller_id = ctx.state.alloc_controller_id();
    ctx.state.controllers.insert(
        controller_id,
        ControllerEntry {
            controller,
            model_root,
            parent: parent_id,
        },
    );
    Ok(())
}

fn handle_destroy_controller(
    ctx: &mut SessionContext<'_>,
    command: Command,
) -> Result<(), SessionError> {
    let Command::DestroyController { controller_id } = command else {
        return Err(SessionError::Unhandled(CommandKind::DestroyController));
    };
    ctx.state.destroy_controller(controller_id);
    Ok(())
}

/// A failing action is caught, logged and recorded as an in-graph error
/// flag; sibling commands in the batch still run.
fn handle_call_action(ctx: &mut SessionContext<'_>, command: Command) -> Result<(), SessionError> {
    let Command::CallAction {
        controller_id,
        action_name,
        params,
    } = command
    else {
        return Err(SessionError::Unhandled(CommandKind::CallAction));
    };
    let store = Arc::clone(&ctx.state.store);
    let result = match ctx.state.controllers.get_mut(&controller_id) {
        Some(entry) => entry.controller.call_action(&action_name, &params, &store),
        None => Err(ControllerError::Action(format!(
            "no controller registered as {controller_id}"
        ))),
    };
    if let Err(err) = result {
        warn!(
            controller_id = %controller_id,
            action = %action_name,
            error = %err,
            "action failed"
        );
        counter!("tidepool_actions_failed_total", 1);
        ctx.state.record_action_error(&err.to_string());
    }
    Ok(())
}
