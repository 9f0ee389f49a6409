//! Endpoint registry.
//!
//! Services are registered explicitly through [`RegistryBuilder`] (or in bulk
//! with [`RegistryBuilder::discover`] for types marked
//! `#[rpc_service(discover)]`). Each callable method becomes an immutable
//! [`EndpointEntry`] keyed by `(service, method)`, both case-insensitive.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::handler::{
    short_type_name, Activator, FromArgs, Instance, IntoReply, InvokeError, InvokeFuture, Invoker,
    ParameterSpec, ServiceFault,
};
use crate::message::error_types;
use crate::protocol::RpcProtocol;

/// A type whose methods can be called over RPC.
///
/// Usually implemented by `#[rpc_service]`; a manual implementation only
/// needs [`register_methods`](Self::register_methods).
pub trait RpcService: Send + Sync + Sized + 'static {
    /// Explicit service name, overriding the naming convention
    fn service_alias() -> Option<&'static str> {
        None
    }

    fn type_name() -> String {
        short_type_name::<Self>()
    }

    fn register_methods(methods: &mut MethodTable<Self>);
}

/// Service name for a type: the alias if given, otherwise the lower-cased
/// type name with a trailing `service` removed (unless that leaves nothing)
pub fn service_name(alias: Option<&str>, type_name: &str) -> String {
    if let Some(alias) = alias.map(str::trim).filter(|alias| !alias.is_empty()) {
        return alias.to_lowercase();
    }
    let lowered = type_name.to_lowercase();
    match lowered.strip_suffix("service") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => lowered,
    }
}

/// Method alias: the explicit alias if given, otherwise the lower-cased method name
pub fn method_alias(alias: Option<&str>, method_name: &str) -> String {
    alias
        .map(str::trim)
        .filter(|alias| !alias.is_empty())
        .unwrap_or(method_name)
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub service: String,
    pub method: String,
}

impl EndpointKey {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            service: service.to_lowercase(),
            method: method.to_lowercase(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// One callable method, ready to invoke
#[derive(Clone)]
pub struct EndpointEntry {
    key: EndpointKey,
    service_type: String,
    method_name: String,
    parameters: Arc<[ParameterSpec]>,
    invoker: Invoker,
    activator: Activator,
}

impl EndpointEntry {
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Name of the declaring Rust type
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Name of the Rust method
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    /// Create a fresh service instance for one call
    pub fn activate(&self) -> Result<Instance, ServiceFault> {
        (self.activator)()
    }

    pub fn invoke(&self, instance: Instance, args: Vec<serde_json::Value>) -> InvokeFuture {
        (self.invoker)(instance, args)
    }
}

impl fmt::Debug for EndpointEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointEntry")
            .field("key", &self.key)
            .field("service_type", &self.service_type)
            .field("method_name", &self.method_name)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Broker-facing facts about a registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub service_name: String,
    pub type_name: String,
}

impl ServiceRegistration {
    /// `{exchange}{service}` when the exchange already ends in `_` or `.`,
    /// otherwise `{exchange}_{service}`
    pub fn queue_name(&self, exchange: &str) -> String {
        if exchange.ends_with('_') || exchange.ends_with('.') {
            format!("{exchange}{}", self.service_name)
        } else {
            format!("{exchange}_{}", self.service_name)
        }
    }

    pub fn binding_key(&self, protocol: &dyn RpcProtocol) -> String {
        protocol.service_binding_key(&self.service_name)
    }
}

struct RegisteredService {
    registration: ServiceRegistration,
    endpoints: HashMap<String, EndpointEntry>,
}

/// Immutable table of every registered endpoint
pub struct EndpointRegistry {
    services: HashMap<String, RegisteredService>,
}

impl EndpointRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<&EndpointEntry> {
        self.services
            .get(&service.to_lowercase())?
            .endpoints
            .get(&method.to_lowercase())
    }

    /// Registered service names, sorted
    pub fn list_services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn registration(&self, service: &str) -> Option<&ServiceRegistration> {
        self.services
            .get(&service.to_lowercase())
            .map(|service| &service.registration)
    }

    /// Method aliases of one service, sorted
    pub fn methods(&self, service: &str) -> Vec<&str> {
        let mut methods: Vec<&str> = self
            .services
            .get(&service.to_lowercase())
            .map(|service| service.endpoints.keys().map(String::as_str).collect())
            .unwrap_or_default();
        methods.sort_unstable();
        methods
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("services", &self.list_services())
            .finish()
    }
}

/// Compile-time registration record emitted by `#[rpc_service(discover)]`
pub struct ServiceDescriptor {
    pub module_path: &'static str,
    pub type_name: &'static str,
    pub install: fn(RegistryBuilder) -> RegistryBuilder,
}

inventory::collect!(ServiceDescriptor);

#[derive(Default)]
pub struct RegistryBuilder {
    services: HashMap<String, RegisteredService>,
}

impl RegistryBuilder {
    /// Register a service whose instances are created by `factory`, once per call
    pub fn service<S, F>(self, factory: F) -> Self
    where
        S: RpcService,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.try_service(move || Ok(factory()))
    }

    /// Register a service with a fallible factory; a failure is reported as
    /// an `ActivationError` for that call
    pub fn try_service<S, F>(mut self, factory: F) -> Self
    where
        S: RpcService,
        F: Fn() -> Result<S, ServiceFault> + Send + Sync + 'static,
    {
        let started = Instant::now();
        let type_name = S::type_name();
        let name = service_name(S::service_alias(), &type_name);

        if self.services.contains_key(&name) {
            warn!(
                service = %name,
                type_name = %type_name,
                "Duplicate service name, keeping the first registration"
            );
            return self;
        }

        let mut table = MethodTable::<S>::new();
        S::register_methods(&mut table);
        for problem in &table.problems {
            warn!(service = %name, "{problem}");
        }

        let activator: Activator = Arc::new(move || factory().map(|service| Arc::new(service) as Instance));
        let mut endpoints: HashMap<String, EndpointEntry> = HashMap::new();
        for method in table.methods {
            let alias = method_alias(method.alias.as_deref(), &method.rust_name);
            if endpoints.contains_key(&alias) {
                warn!(
                    service = %name,
                    method = %alias,
                    rust_method = %method.rust_name,
                    "Duplicate method alias, keeping the first registration"
                );
                continue;
            }
            debug!(service = %name, method = %alias, "Registered endpoint");
            endpoints.insert(
                alias.clone(),
                EndpointEntry {
                    key: EndpointKey::new(&name, &alias),
                    service_type: type_name.clone(),
                    method_name: method.rust_name,
                    parameters: method.parameters.into(),
                    invoker: method.invoker,
                    activator: Arc::clone(&activator),
                },
            );
        }

        if endpoints.is_empty() {
            warn!(
                service = %name,
                type_name = %type_name,
                "Service has no callable methods and will not be registered"
            );
            return self;
        }

        info!(
            service = %name,
            type_name = %type_name,
            methods = endpoints.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Registered service"
        );
        self.services.insert(
            name.clone(),
            RegisteredService {
                registration: ServiceRegistration {
                    service_name: name,
                    type_name,
                },
                endpoints,
            },
        );
        self
    }

    pub fn default_service<S: RpcService + Default>(self) -> Self {
        self.service(S::default)
    }

    /// Install every `#[rpc_service(discover)]` type declared in `module_path`
    /// or below it (an empty prefix installs all of them), in a stable order
    pub fn discover(mut self, module_path: &str) -> Self {
        let mut found: Vec<&ServiceDescriptor> = inventory::iter::<ServiceDescriptor>
            .into_iter()
            .filter(|descriptor| within_module(descriptor.module_path, module_path))
            .collect();
        found.sort_by_key(|descriptor| (descriptor.module_path, descriptor.type_name));

        if found.is_empty() {
            warn!(module = %module_path, "No discoverable services found");
        } else {
            info!(module = %module_path, count = found.len(), "Discovered services");
        }
        for descriptor in found {
            self = (descriptor.install)(self);
        }
        self
    }

    pub fn build(self) -> EndpointRegistry {
        EndpointRegistry {
            services: self.services,
        }
    }
}

fn within_module(candidate: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || candidate == prefix
        || candidate
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with("::"))
}

struct MethodDefinition {
    rust_name: String,
    alias: Option<String>,
    parameters: Vec<ParameterSpec>,
    invoker: Invoker,
}

/// Collects the callable methods of one service type
pub struct MethodTable<S> {
    methods: Vec<MethodDefinition>,
    problems: Vec<String>,
    _service: PhantomData<fn() -> S>,
}

impl<S: RpcService> MethodTable<S> {
    fn new() -> Self {
        Self {
            methods: Vec::new(),
            problems: Vec::new(),
            _service: PhantomData,
        }
    }

    /// Start describing the method named `rust_name`
    pub fn callable(&mut self, rust_name: &str) -> MethodBuilder<'_, S> {
        MethodBuilder {
            table: self,
            rust_name: rust_name.to_string(),
            alias: None,
            parameters: Vec::new(),
        }
    }
}

/// Describes one method; finish with [`sync`](Self::sync) or [`future`](Self::future)
pub struct MethodBuilder<'a, S> {
    table: &'a mut MethodTable<S>,
    rust_name: String,
    alias: Option<String>,
    parameters: Vec<ParameterSpec>,
}

impl<'a, S: RpcService> MethodBuilder<'a, S> {
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// Declare the next parameter
    pub fn param<T: DeserializeOwned>(mut self, name: &str) -> Self {
        self.parameters.push(ParameterSpec::of::<T>(name));
        self
    }

    /// Declare the next parameter with a default used when the caller omits it
    pub fn param_or<T: DeserializeOwned + Serialize>(mut self, name: &str, default: T) -> Self {
        let spec = ParameterSpec::of::<T>(name);
        match serde_json::to_value(default) {
            Ok(value) => self.parameters.push(spec.with_default(value)),
            Err(err) => {
                self.table.problems.push(format!(
                    "Default for parameter '{name}' of '{}' is not serializable: {err}",
                    self.rust_name
                ));
                self.parameters.push(spec);
            }
        }
        self
    }

    /// Register a synchronous method; its value becomes a completed result
    pub fn sync<A, R, F>(self, method: F)
    where
        A: FromArgs + 'static,
        R: IntoReply + 'static,
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        let method = Arc::new(method);
        let specs: Arc<[ParameterSpec]> = self.parameters.clone().into();
        let invoker: Invoker = Arc::new(move |instance: Instance, args: Vec<serde_json::Value>| -> InvokeFuture {
            let method = Arc::clone(&method);
            let specs = Arc::clone(&specs);
            Box::pin(async move {
                let service = downcast::<S>(instance)?;
                let args = A::from_args(args, &specs)?;
                method(&*service, args).into_reply().map_err(InvokeError::from)
            })
        });
        self.finish(A::ARITY, invoker);
    }

    /// Register an asynchronous method; it is awaited and its output converted
    pub fn future<A, R, Fut, F>(self, method: F)
    where
        A: FromArgs + Send + 'static,
        R: IntoReply + 'static,
        Fut: Future<Output = R> + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
    {
        let method = Arc::new(method);
        let specs: Arc<[ParameterSpec]> = self.parameters.clone().into();
        let invoker: Invoker = Arc::new(move |instance: Instance, args: Vec<serde_json::Value>| -> InvokeFuture {
            let method = Arc::clone(&method);
            let specs = Arc::clone(&specs);
            Box::pin(async move {
                let service = downcast::<S>(instance)?;
                let args = A::from_args(args, &specs)?;
                method(service, args).await.into_reply().map_err(InvokeError::from)
            })
        });
        self.finish(A::ARITY, invoker);
    }

    fn finish(self, arity: usize, invoker: Invoker) {
        if arity != self.parameters.len() {
            self.table.problems.push(format!(
                "Method '{}' declares {} parameters but takes {}; skipped",
                self.rust_name,
                self.parameters.len(),
                arity
            ));
            return;
        }
        self.table.methods.push(MethodDefinition {
            rust_name: self.rust_name,
            alias: self.alias,
            parameters: self.parameters,
            invoker,
        });
    }
}

fn downcast<S: Send + Sync + 'static>(instance: Instance) -> Result<Arc<S>, InvokeError> {
    instance.downcast::<S>().map_err(|_| {
        InvokeError::Fault(ServiceFault::new(
            format!("service instance is not a {}", short_type_name::<S>()),
            error_types::ACTIVATION_ERROR,
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct SimpleService;

    impl RpcService for SimpleService {
        fn register_methods(methods: &mut MethodTable<Self>) {
            methods
                .callable("Multiple")
                .param::<i64>("a")
                .param::<i64>("b")
                .sync(|_, (a, b): (i64, i64)| crate::Reply(a * b));
            methods
                .callable("multiple_again")
                .alias("MULTIPLE")
                .param::<i64>("a")
                .param::<i64>("b")
                .sync(|_, (a, b): (i64, i64)| crate::Reply(a + b));
        }
    }

    #[derive(Default)]
    struct NamedService;

    impl RpcService for NamedService {
        fn service_alias() -> Option<&'static str> {
            Some(" Just_Name_Me ")
        }

        fn register_methods(methods: &mut MethodTable<Self>) {
            methods
                .callable("subtract")
                .alias("and_me")
                .param::<i64>("a")
                .param::<i64>("b")
                .sync(|_, (a, b): (i64, i64)| crate::Reply(a - b));
        }
    }

    #[derive(Default)]
    struct EmptyService;

    impl RpcService for EmptyService {
        fn register_methods(_: &mut MethodTable<Self>) {}
    }

    #[derive(Default)]
    struct Service;

    impl RpcService for Service {
        fn register_methods(methods: &mut MethodTable<Self>) {
            methods.callable("ping").sync(|_, (): ()| crate::Reply("pong"));
        }
    }

    #[test]
    fn naming_convention() {
        assert_eq!(service_name(None, "SimpleService"), "simple");
        assert_eq!(service_name(None, "Service"), "service");
        assert_eq!(service_name(None, "Billing"), "billing");
        assert_eq!(service_name(Some("  Orders "), "Whatever"), "orders");
        assert_eq!(service_name(Some(""), "UserService"), "user");
        assert_eq!(method_alias(None, "Multiple"), "multiple");
        assert_eq!(method_alias(Some("And_Me"), "subtract"), "and_me");
    }

    #[test]
    fn queue_naming() {
        let registration = ServiceRegistration {
            service_name: "simple".into(),
            type_name: "SimpleService".into(),
        };
        assert_eq!(registration.queue_name("aid_rpc"), "aid_rpc_simple");
        assert_eq!(registration.queue_name("rpc_"), "rpc_simple");
        assert_eq!(registration.queue_name("rpc."), "rpc.simple");
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let registry = EndpointRegistry::builder()
            .default_service::<SimpleService>()
            .default_service::<NamedService>()
            .default_service::<Service>()
            .build();

        assert_eq!(registry.list_services(), vec!["just_name_me", "service", "simple"]);
        let entry = registry.lookup("SIMPLE", "Multiple").unwrap();
        assert_eq!(entry.key(), &EndpointKey::new("simple", "multiple"));
        assert_eq!(entry.method_name(), "Multiple");
        assert_eq!(entry.service_type(), "SimpleService");
        assert_eq!(entry.parameters().len(), 2);

        assert!(registry.lookup("just_name_me", "and_me").is_some());
        assert!(registry.lookup("just_name_me", "subtract").is_none());
        assert!(registry.lookup("simple", "ghost").is_none());
        assert!(registry.lookup("ghost", "multiple").is_none());
    }

    #[tokio::test]
    async fn duplicate_alias_keeps_first() {
        let registry = EndpointRegistry::builder()
            .default_service::<SimpleService>()
            .build();
        assert_eq!(registry.methods("simple"), vec!["multiple"]);

        let entry = registry.lookup("simple", "multiple").unwrap();
        let instance = entry.activate().unwrap();
        let result = entry.invoke(instance, vec![json!(5), json!(10)]).await.unwrap();
        assert_eq!(result, Some(json!(50)));
    }

    #[test]
    fn duplicate_service_keeps_first() {
        struct OtherSimple;

        impl RpcService for OtherSimple {
            fn service_alias() -> Option<&'static str> {
                Some("simple")
            }

            fn register_methods(methods: &mut MethodTable<Self>) {
                methods.callable("other").sync(|_, (): ()| ());
            }
        }

        let registry = EndpointRegistry::builder()
            .default_service::<SimpleService>()
            .service(|| OtherSimple)
            .build();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("simple", "other").is_none());
        assert_eq!(registry.registration("simple").unwrap().type_name, "SimpleService");
    }

    #[test]
    fn service_without_methods_is_dropped() {
        let registry = EndpointRegistry::builder()
            .default_service::<EmptyService>()
            .build();
        assert!(registry.is_empty());
    }

    #[test]
    fn arity_mismatch_skips_the_method() {
        struct Mismatch;

        impl RpcService for Mismatch {
            fn register_methods(methods: &mut MethodTable<Self>) {
                methods
                    .callable("broken")
                    .param::<i64>("a")
                    .sync(|_, (a, b): (i64, i64)| crate::Reply(a + b));
                methods.callable("fine").sync(|_, (): ()| ());
            }
        }

        let registry = EndpointRegistry::builder().service(|| Mismatch).build();
        assert_eq!(registry.methods("mismatch"), vec!["fine"]);
    }

    #[test]
    fn module_prefix_matching() {
        assert!(within_module("app::services::billing", "app::services"));
        assert!(within_module("app::services", "app::services"));
        assert!(within_module("anything", ""));
        assert!(!within_module("app::services_extra", "app::services"));
    }
}
