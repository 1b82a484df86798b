//! Agent class definitions and the per-class method registry.
//!
//! Methods are opt-in: only names registered here resolve for remote
//! invocation (`callable`/`streaming`) or for schedule and queue fires
//! (`callback`). Registration happens once, when the class is built.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::agent::handler::AgentHandler;
use crate::agent::instance::Agent;
use crate::error::Result;
use crate::name::kebab_case;
use crate::rpc::StreamingResponse;

/// Boxed future returned by registered methods.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A remotely-invocable method.
pub type CallableFn = Arc<dyn Fn(Agent, Vec<Value>) -> MethodFuture + Send + Sync>;

/// A remotely-invocable streaming method. Chunks go through the sink; the
/// returned value ends the stream if the sink was not ended explicitly.
pub type StreamingFn =
    Arc<dyn Fn(Agent, Vec<Value>, StreamingResponse) -> MethodFuture + Send + Sync>;

/// A schedule/queue fire target.
pub type CallbackFn = Arc<dyn Fn(Agent, Value) -> MethodFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) enum CallableKind {
    Unary(CallableFn),
    Streaming(StreamingFn),
}

/// A registered agent class: shared behavior plus the method registry.
pub struct AgentClass {
    name: String,
    kebab: String,
    pub(crate) handler: Arc<dyn AgentHandler>,
    pub(crate) callables: HashMap<String, CallableKind>,
    pub(crate) callbacks: HashMap<String, CallbackFn>,
}

impl AgentClass {
    pub fn builder(name: impl Into<String>, handler: impl AgentHandler) -> AgentClassBuilder {
        AgentClassBuilder {
            name: name.into(),
            handler: Arc::new(handler),
            callables: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    /// The class name as registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kebab-case routing segment.
    pub fn kebab_name(&self) -> &str {
        &self.kebab
    }

    pub fn is_callable(&self, method: &str) -> bool {
        self.callables.contains_key(method)
    }

    pub fn has_callback(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }
}

impl std::fmt::Debug for AgentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClass")
            .field("name", &self.name)
            .field("kebab", &self.kebab)
            .field("callables", &self.callables.keys().collect::<Vec<_>>())
            .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`AgentClass`].
pub struct AgentClassBuilder {
    name: String,
    handler: Arc<dyn AgentHandler>,
    callables: HashMap<String, CallableKind>,
    callbacks: HashMap<String, CallbackFn>,
}

impl AgentClassBuilder {
    /// Mark a method as remotely invocable.
    pub fn callable<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Agent, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.callables.insert(
            name.into(),
            CallableKind::Unary(Arc::new(move |agent, args| {
                let f = Arc::clone(&f);
                Box::pin(async move { f(agent, args).await })
            })),
        );
        self
    }

    /// Mark a streaming method as remotely invocable.
    pub fn streaming<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Agent, Vec<Value>, StreamingResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.callables.insert(
            name.into(),
            CallableKind::Streaming(Arc::new(move |agent, args, sink| {
                let f = Arc::clone(&f);
                Box::pin(async move { f(agent, args, sink).await })
            })),
        );
        self
    }

    /// Register a schedule/queue fire target.
    pub fn callback<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Agent, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.callbacks.insert(
            name.into(),
            Arc::new(move |agent, payload| {
                let f = Arc::clone(&f);
                Box::pin(async move { f(agent, payload).await })
            }),
        );
        self
    }

    pub fn build(self) -> AgentClass {
        AgentClass {
            kebab: kebab_case(&self.name),
            name: self.name,
            handler: self.handler,
            callables: self.callables,
            callbacks: self.callbacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;
    impl AgentHandler for NoopHandler {}

    #[test]
    fn builder_registers_methods() {
        let class = AgentClass::builder("CounterAgent", NoopHandler)
            .callable("addNumbers", |_agent, _args| async move {
                Ok(Value::Null)
            })
            .streaming("streamText", |_agent, _args, _sink| async move {
                Ok(Value::Null)
            })
            .callback("onTick", |_agent, _payload| async move { Ok(Value::Null) })
            .build();

        assert_eq!(class.name(), "CounterAgent");
        assert_eq!(class.kebab_name(), "counter-agent");
        assert!(class.is_callable("addNumbers"));
        assert!(class.is_callable("streamText"));
        assert!(!class.is_callable("onTick"));
        assert!(class.has_callback("onTick"));
        assert!(!class.has_callback("addNumbers"));
    }
}
