use crate::action::{ActionDescriptor, ActionId, Handler, Marshalling, ParamType};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors raised while registering, looking up, or encoding arguments for an action
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RegistryError {
    /// the id is already taken, the earlier registration stays active
    DuplicateAction(ActionId),
    /// no action is registered under this id
    UnknownAction(ActionId),
    /// a Raw action must declare exactly (Pointer, SizeT)
    InvalidRawSignature {
        action: ActionId,
        params: Vec<ParamType>,
    },
    /// supplied arguments do not match the declared parameters
    ArgumentMismatch { index: usize, reason: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateAction(id) => write!(f, "{} is already registered", id),
            RegistryError::UnknownAction(id) => write!(f, "{} is not registered", id),
            RegistryError::InvalidRawSignature { action, params } => write!(
                f,
                "raw action {} must take (Pointer, SizeT), declared {:?}",
                action, params
            ),
            RegistryError::ArgumentMismatch { index, reason } => {
                write!(f, "argument {} mismatch: {}", index, reason)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// A node's table of registered actions.
///
/// Entries are immutable once registered and are shared out as `Arc<ActionDescriptor>`.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<ActionId, Arc<ActionDescriptor>>>,
}

impl ActionRegistry {
    pub(crate) fn new() -> ActionRegistry {
        ActionRegistry::default()
    }

    /// Register `handler` under `id`
    ///
    /// # Examples
    ///```
    /// use amgas::{handler, ActionId, Marshalling, ParamType, RegistryError};
    ///
    /// let world = amgas::WorldBuilder::new().build();
    /// let node = world.node(0);
    /// let registry = node.registry();
    /// let echo = handler(|_ctx, args| async move { Ok(args.into_bytes()?) });
    /// registry.register(ActionId(7), echo.clone(), Marshalling::Raw, vec![ParamType::Pointer, ParamType::SizeT])?;
    /// assert_eq!(
    ///     registry.register(ActionId(7), echo, Marshalling::Raw, vec![ParamType::Pointer, ParamType::SizeT]).err(),
    ///     Some(RegistryError::DuplicateAction(ActionId(7)))
    /// );
    ///```
    pub fn register(
        &self,
        id: ActionId,
        handler: Handler,
        marshalling: Marshalling,
        params: Vec<ParamType>,
    ) -> Result<Arc<ActionDescriptor>, RegistryError> {
        self.register_descriptor(ActionDescriptor::new(id, marshalling, params, handler))
    }

    /// Register a fully built descriptor, keeping its name and attributes
    pub fn register_descriptor(
        &self,
        desc: ActionDescriptor,
    ) -> Result<Arc<ActionDescriptor>, RegistryError> {
        Self::validate(&desc)?;
        let mut actions = self.actions.write();
        if actions.contains_key(&desc.id) {
            return Err(RegistryError::DuplicateAction(desc.id));
        }
        tracing::debug!(
            "registered {} {:?} {:?} pinned: {}",
            desc.id,
            desc.name,
            desc.marshalling,
            desc.pinned
        );
        let desc = Arc::new(desc);
        actions.insert(desc.id, desc.clone());
        Ok(desc)
    }

    pub(crate) fn validate(desc: &ActionDescriptor) -> Result<(), RegistryError> {
        if desc.marshalling == Marshalling::Raw
            && desc.params != [ParamType::Pointer, ParamType::SizeT]
        {
            return Err(RegistryError::InvalidRawSignature {
                action: desc.id,
                params: desc.params.clone(),
            });
        }
        if desc.marshalling == Marshalling::Fixed && desc.params.contains(&ParamType::Pointer) {
            return Err(RegistryError::ArgumentMismatch {
                index: desc
                    .params
                    .iter()
                    .position(|p| *p == ParamType::Pointer)
                    .unwrap_or_default(),
                reason: "pointers cannot be copied by value".to_owned(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.actions.read().contains_key(&id)
    }

    pub fn lookup(&self, id: ActionId) -> Result<Arc<ActionDescriptor>, RegistryError> {
        self.actions
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownAction(id))
    }

    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.read().is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<ActionId> = self.actions.read().keys().copied().collect();
        ids.sort();
        f.debug_struct("ActionRegistry").field("actions", &ids).finish()
    }
}
