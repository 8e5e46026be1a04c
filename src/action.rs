//! Actions: remotely invocable handlers identified by a stable [ActionId].
//!
//! An action is described by an [ActionDescriptor] and registered with every node's [ActionRegistry] before it is invoked.
//! Arguments are marshalled in one of two [Marshalling] modes:
//! - [Marshalling::Fixed]: a fixed arity list of typed scalar [Value]s, checked positionally against the descriptor's [ParamType]s
//! - [Marshalling::Raw]: an opaque byte buffer and its length, interpreted entirely by the handler
//!
//! # Examples
//!```
//! use amgas::{handler, ActionDescriptor, ActionId, Args, Marshalling, ParamType, Value};
//!
//! const ADD_ONE: ActionId = ActionId(1);
//!
//! let add_one = ActionDescriptor::new(
//!     ADD_ONE,
//!     Marshalling::Fixed,
//!     vec![ParamType::Long],
//!     handler(|_ctx, args: Args| async move {
//!         let x: i64 = args.get(0)?;
//!         Ok(amgas::serialize(&(x + 1))?)
//!     }),
//! );
//! let world = amgas::WorldBuilder::new().build();
//! world.register_action(add_one)?;
//! let res = world.block_on(world.call_sync(0, ADD_ONE, Args::Fixed(vec![Value::Long(41)])))?;
//! assert_eq!(amgas::deserialize::<i64>(&res)?, 42);
//!```
use crate::gas::GlobalAddress;
use crate::lco::LcoAddr;

use futures::future::BoxFuture;
use futures::{Future, FutureExt};
use std::sync::Arc;

pub(crate) mod context;
pub use context::ActionContext;

pub(crate) mod registry;
pub use registry::{ActionRegistry, RegistryError};

/// Process wide identifier of an action
#[derive(
    serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct ActionId(pub u32);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

/// How the arguments of an action are encoded
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marshalling {
    /// statically typed, fixed arity argument tuple copied by value
    Fixed,
    /// opaque byte buffer plus its length
    Raw,
}

/// The parameter types an action may declare
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    Char,
    Short,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    SizeT,
    /// pointer to bytes, only valid as the first parameter of a [Marshalling::Raw] action
    Pointer,
    Addr,
    Lco,
}

/// A single Fixed mode argument
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Char(i8),
    Short(i16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    SizeT(u64),
    Addr(GlobalAddress),
    Lco(LcoAddr),
}

impl Value {
    pub fn param_type(&self) -> ParamType {
        match self {
            Value::Char(_) => ParamType::Char,
            Value::Short(_) => ParamType::Short,
            Value::Int(_) => ParamType::Int,
            Value::UInt(_) => ParamType::UInt,
            Value::Long(_) => ParamType::Long,
            Value::ULong(_) => ParamType::ULong,
            Value::Float(_) => ParamType::Float,
            Value::Double(_) => ParamType::Double,
            Value::SizeT(_) => ParamType::SizeT,
            Value::Addr(_) => ParamType::Addr,
            Value::Lco(_) => ParamType::Lco,
        }
    }
}

/// Conversion out of a [Value], used by [Args::get]
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($($ty:ty => $($variant:ident)|+;)*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        $(Value::$variant(v) => Some(*v as $ty),)+
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_from_value! {
    i8 => Char;
    i16 => Short;
    i32 => Int;
    u32 => UInt;
    i64 => Long;
    u64 => ULong | SizeT;
    usize => SizeT;
    f32 => Float;
    f64 => Double;
}

impl FromValue for GlobalAddress {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Addr(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl FromValue for LcoAddr {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Lco(addr) => Some(*addr),
            _ => None,
        }
    }
}

/// Encoded arguments of one invocation
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub enum Args {
    Fixed(Vec<Value>),
    Raw(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Args {
    /// An empty Fixed argument list
    pub fn none() -> Args {
        Args::Fixed(vec![])
    }

    /// Typed access to the Fixed argument at `index`
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, RegistryError> {
        match self {
            Args::Fixed(values) => values
                .get(index)
                .and_then(T::from_value)
                .ok_or_else(|| RegistryError::ArgumentMismatch {
                    index,
                    reason: format!(
                        "expected {} found {:?}",
                        std::any::type_name::<T>(),
                        values.get(index)
                    ),
                }),
            Args::Raw(_) => Err(RegistryError::ArgumentMismatch {
                index,
                reason: "raw buffer has no positional arguments".to_owned(),
            }),
        }
    }

    /// The buffer of a Raw invocation
    pub fn bytes(&self) -> Result<&[u8], RegistryError> {
        match self {
            Args::Raw(bytes) => Ok(bytes),
            Args::Fixed(_) => Err(RegistryError::ArgumentMismatch {
                index: 0,
                reason: "fixed arguments carry no raw buffer".to_owned(),
            }),
        }
    }

    /// Consume a Raw invocation's buffer
    pub fn into_bytes(self) -> Result<Vec<u8>, RegistryError> {
        match self {
            Args::Raw(bytes) => Ok(bytes),
            Args::Fixed(_) => Err(RegistryError::ArgumentMismatch {
                index: 0,
                reason: "fixed arguments carry no raw buffer".to_owned(),
            }),
        }
    }
}

/// The body of an action. It receives the execution context and the decoded arguments
/// and produces the bytes routed to the caller, continuation, or control object.
pub type Handler =
    Arc<dyn Fn(ActionContext, Args) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync>;

/// Wrap an async closure as a [Handler]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(ActionContext, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    Arc::new(move |ctx, args| f(ctx, args).boxed())
}

/// Everything a node needs to encode, decode and run an action
#[derive(Clone)]
pub struct ActionDescriptor {
    pub(crate) id: ActionId,
    pub(crate) name: Option<String>,
    pub(crate) handler: Handler,
    pub(crate) marshalling: Marshalling,
    pub(crate) params: Vec<ParamType>,
    pub(crate) pinned: bool,
}

impl ActionDescriptor {
    pub fn new(
        id: ActionId,
        marshalling: Marshalling,
        params: Vec<ParamType>,
        handler: Handler,
    ) -> ActionDescriptor {
        ActionDescriptor {
            id,
            name: None,
            handler,
            marshalling,
            params,
            pinned: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> ActionDescriptor {
        self.name = Some(name.into());
        self
    }

    /// The target address must resolve to the executing node, the handler is free to pin it
    pub fn pinned(mut self) -> ActionDescriptor {
        self.pinned = true;
        self
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn marshalling(&self) -> Marshalling {
        self.marshalling
    }

    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Validate that `args` can be delivered to this action
    pub fn check(&self, args: &Args) -> Result<(), RegistryError> {
        match (self.marshalling, args) {
            (Marshalling::Raw, Args::Raw(_)) => Ok(()),
            (Marshalling::Fixed, Args::Fixed(values)) => {
                if values.len() != self.params.len() {
                    return Err(RegistryError::ArgumentMismatch {
                        index: values.len().min(self.params.len()),
                        reason: format!(
                            "{} takes {} arguments, {} supplied",
                            self.id,
                            self.params.len(),
                            values.len()
                        ),
                    });
                }
                match values
                    .iter()
                    .zip(self.params.iter())
                    .position(|(v, p)| v.param_type() != *p)
                {
                    Some(index) => Err(RegistryError::ArgumentMismatch {
                        index,
                        reason: format!(
                            "{} expects {:?}, found {:?}",
                            self.id, self.params[index], values[index]
                        ),
                    }),
                    None => Ok(()),
                }
            }
            (mode, _) => Err(RegistryError::ArgumentMismatch {
                index: 0,
                reason: format!("{} is a {:?} action", self.id, mode),
            }),
        }
    }
}

impl std::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("marshalling", &self.marshalling)
            .field("params", &self.params)
            .field("pinned", &self.pinned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        handler(|_ctx, _args| async { Ok(vec![]) })
    }

    #[test]
    fn fixed_args_are_checked_positionally() {
        let desc = ActionDescriptor::new(
            ActionId(3),
            Marshalling::Fixed,
            vec![ParamType::Int, ParamType::Long],
            noop(),
        );
        assert!(desc
            .check(&Args::Fixed(vec![Value::Int(1), Value::Long(2)]))
            .is_ok());
        assert!(matches!(
            desc.check(&Args::Fixed(vec![Value::Long(2), Value::Int(1)])),
            Err(RegistryError::ArgumentMismatch { index: 0, .. })
        ));
        assert!(matches!(
            desc.check(&Args::Fixed(vec![Value::Int(1)])),
            Err(RegistryError::ArgumentMismatch { index: 1, .. })
        ));
        assert!(desc.check(&Args::Raw(vec![1, 2, 3])).is_err());
    }

    #[test]
    fn typed_access() {
        let args = Args::Fixed(vec![Value::Int(-4), Value::SizeT(9), Value::Double(0.5)]);
        assert_eq!(args.get::<i32>(0).unwrap(), -4);
        assert_eq!(args.get::<usize>(1).unwrap(), 9);
        assert_eq!(args.get::<u64>(1).unwrap(), 9);
        assert_eq!(args.get::<f64>(2).unwrap(), 0.5);
        assert!(args.get::<f32>(2).is_err());
        assert!(args.get::<i32>(3).is_err());
        assert!(args.bytes().is_err());
        let raw = Args::Raw(vec![9; 4]);
        assert_eq!(raw.bytes().unwrap(), &[9; 4]);
        assert!(raw.get::<i32>(0).is_err());
    }
}
