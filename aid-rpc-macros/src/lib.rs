//! # aid-rpc macros
//!
//! Attribute macros that turn an ordinary impl block into an RPC service:
//! - `#[rpc_service]` - implements `aid_rpc::RpcService` for the impl's type
//! - `#[rpc_callable]` - marks a method as remotely callable
//! - `#[rpc_default(expr)]` - default for a parameter the caller may omit
//!
//! ```rust,ignore
//! use aid_rpc::rpc_service;
//!
//! #[derive(Default)]
//! pub struct NamedService;
//!
//! #[rpc_service(name = "just_name_me", discover)]
//! impl NamedService {
//!     #[rpc_callable(alias = "and_me")]
//!     fn subtract(&self, a: i64, #[rpc_default(1)] b: i64) -> i64 {
//!         a - b
//!     }
//!
//!     #[rpc_callable]
//!     async fn greet(&self, #[rpc_default("Hello")] greeting: String, name: String) -> String {
//!         format!("{greeting}, {name}")
//!     }
//! }
//! ```
//!
//! The service is called `just_name_me` (without `name` it would be the
//! lower-cased type name minus a trailing `Service`, here `named`). Methods
//! are addressed by their alias or their lower-cased name, and parameters by
//! their Rust names. `discover` lets `RegistryBuilder::discover` find the
//! type; it requires `Default`.
//!
//! Return values:
//! - `()` - the reply has no result
//! - `Result<T, E>` - `Ok` becomes the result, `Err` an error reply whose
//!   type is the short name of `E`
//! - anything else - serialized as the result

extern crate proc_macro;

mod service_impl;
mod service_method;

use proc_macro::TokenStream;

/// Implements `aid_rpc::RpcService` for the type of the annotated impl block.
///
/// Arguments: `name = "..."` overrides the service name, `discover` registers
/// the type for `RegistryBuilder::discover`.
#[proc_macro_attribute]
pub fn rpc_service(args: TokenStream, input: TokenStream) -> TokenStream {
    service_impl::impl_rpc_service(args, input)
}

/// Marks a method inside an `#[rpc_service]` impl block as callable.
///
/// `#[rpc_callable("alias")]` or `#[rpc_callable(alias = "alias")]` exposes
/// it under another name. Methods must take `&self`.
#[proc_macro_attribute]
pub fn rpc_callable(args: TokenStream, input: TokenStream) -> TokenStream {
    service_method::impl_rpc_callable(args, input)
}
