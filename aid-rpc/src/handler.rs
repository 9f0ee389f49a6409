//! Statically typed adapters between JSON arguments and service methods.
//!
//! Every callable method is compiled into an [`Invoker`]: a closure that
//! downcasts the per-call service instance, decodes its ordered argument
//! values into the method's parameter tuple ([`FromArgs`]), calls the method
//! and converts whatever it returns ([`IntoReply`]).

use std::any::Any;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::message::{error_types, RemoteError};

/// A service instance, type-erased
pub type Instance = Arc<dyn Any + Send + Sync>;

pub type InvokeFuture = BoxFuture<'static, Result<Option<Value>, InvokeError>>;

/// `(instance, ordered arguments) -> async result`
pub type Invoker = Arc<dyn Fn(Instance, Vec<Value>) -> InvokeFuture + Send + Sync>;

/// Creates one service instance per dispatch
pub type Activator = Arc<dyn Fn() -> Result<Instance, ServiceFault> + Send + Sync>;

/// Declared shape of one method parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub type_name: String,
    pub default: Option<Value>,
    /// `null` is a valid value for the parameter (e.g. `Option<T>`)
    pub nullable: bool,
}

impl ParameterSpec {
    pub fn of<T: DeserializeOwned>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: short_type_name::<T>(),
            default: None,
            nullable: serde_json::from_value::<T>(Value::Null).is_ok(),
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Failure while invoking a compiled method
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// An argument value did not fit the declared parameter type
    Argument {
        name: String,
        expected: String,
        reason: String,
    },
    /// The method (or its activation) reported an error
    Fault(ServiceFault),
}

impl InvokeError {
    pub fn into_remote(self) -> RemoteError {
        match self {
            Self::Argument {
                name,
                expected,
                reason,
            } => RemoteError::new(
                format!("Failed to deserialize parameter '{name}'. Expected: {expected}. Error: {reason}"),
                error_types::ARGUMENT_ERROR,
            ),
            Self::Fault(fault) => fault.into_remote(),
        }
    }
}

impl From<ServiceFault> for InvokeError {
    fn from(fault: ServiceFault) -> Self {
        Self::Fault(fault)
    }
}

/// An error reported by service code, already shaped for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFault {
    pub message: String,
    pub error_type: String,
    pub stack_trace: Option<String>,
}

impl ServiceFault {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            stack_trace: None,
        }
    }

    /// Convert any error; its short type name becomes the error type and its
    /// `Debug` output the stack trace. A `ServiceFault` passes through as is.
    pub fn from_error<E: Display + Debug + 'static>(err: E) -> Self {
        if let Some(fault) = (&err as &dyn Any).downcast_ref::<ServiceFault>() {
            return fault.clone();
        }
        Self {
            message: err.to_string(),
            error_type: short_type_name::<E>(),
            stack_trace: Some(format!("{err:?}")),
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    pub fn into_remote(self) -> RemoteError {
        RemoteError {
            message: self.message,
            error_type: Some(self.error_type),
            stack_trace: self.stack_trace,
        }
    }
}

impl Display for ServiceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for ServiceFault {}

/// Converts a method's return value into a response result
pub trait IntoReply {
    fn into_reply(self) -> Result<Option<Value>, ServiceFault>;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Option<Value>, ServiceFault> {
        Ok(None)
    }
}

impl<T: Serialize, E: Display + Debug + 'static> IntoReply for Result<T, E> {
    fn into_reply(self) -> Result<Option<Value>, ServiceFault> {
        match self {
            Ok(value) => Reply(value).into_reply(),
            Err(err) => Err(ServiceFault::from_error(err)),
        }
    }
}

/// Wraps an infallible return value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply<T>(pub T);

impl<T: Serialize> IntoReply for Reply<T> {
    fn into_reply(self) -> Result<Option<Value>, ServiceFault> {
        match serde_json::to_value(self.0) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(ServiceFault::new(
                format!("Failed to serialize result: {err}"),
                error_types::SERIALIZATION_ERROR,
            )),
        }
    }
}

/// A tuple of method parameters decodable from ordered JSON values
pub trait FromArgs: Sized {
    const ARITY: usize;

    fn from_args(args: Vec<Value>, specs: &[ParameterSpec]) -> Result<Self, InvokeError>;
}

fn decode_arg<T: DeserializeOwned>(value: Value, spec: Option<&ParameterSpec>) -> Result<T, InvokeError> {
    serde_json::from_value(value).map_err(|err| InvokeError::Argument {
        name: spec.map(|spec| spec.name.clone()).unwrap_or_default(),
        expected: spec
            .map(|spec| spec.type_name.clone())
            .unwrap_or_else(short_type_name::<T>),
        reason: err.to_string(),
    })
}

macro_rules! impl_from_args {
    ($arity:expr; $($ty:ident $index:tt),*) => {
        impl<$($ty: DeserializeOwned),*> FromArgs for ($($ty,)*) {
            const ARITY: usize = $arity;

            #[allow(unused_mut, unused_variables)]
            fn from_args(args: Vec<Value>, specs: &[ParameterSpec]) -> Result<Self, InvokeError> {
                let mut values = args.into_iter();
                Ok(($(
                    decode_arg::<$ty>(values.next().unwrap_or(Value::Null), specs.get($index))?,
                )*))
            }
        }
    };
}

impl_from_args!(0;);
impl_from_args!(1; A 0);
impl_from_args!(2; A 0, B 1);
impl_from_args!(3; A 0, B 1, C 2);
impl_from_args!(4; A 0, B 1, C 2, D 3);
impl_from_args!(5; A 0, B 1, C 2, D 3, E 4);
impl_from_args!(6; A 0, B 1, C 2, D 3, E 4, F 5);
impl_from_args!(7; A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_from_args!(8; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);

/// `std::any::type_name` with module paths stripped, e.g. `Option<i64>`
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let mut short = String::with_capacity(full.len());
    let mut path = String::new();
    for ch in full.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == ':' {
            path.push(ch);
        } else {
            short.push_str(last_segment(&path));
            path.clear();
            short.push(ch);
        }
    }
    short.push_str(last_segment(&path));
    short
}

fn last_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}
