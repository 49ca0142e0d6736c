//! Handler registry for dispatching requests by method name.
//!
//! Handlers are async functions taking deserialized params and returning a
//! serializable result or an [`RpcError`]. The [`TypedHandler`] wrapper
//! adapts them to the untyped [`Handler`] trait the dispatch loop calls.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::protocol::RpcError;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one dispatched method call.
pub type HandlerResult = std::result::Result<Value, RpcError>;

/// Trait for registered method handlers.
///
/// Takes the raw `params` value from the request (`None` when the field was
/// absent) and produces the reply's `result` or `error`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, params: Option<Value>) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes params before calling the handler and
/// serializes its output back.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    Fut: Future<Output = std::result::Result<R, RpcError>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    Fut: Future<Output = std::result::Result<R, RpcError>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    Fut: Future<Output = std::result::Result<R, RpcError>> + Send + 'static,
{
    fn call(&self, params: Option<Value>) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match serde_json::from_value(params.unwrap_or(Value::Null)) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(invocation_error(e.to_string())) }),
        };

        let fut = (self.handler)(parsed);
        Box::pin(async move {
            match fut.await {
                Ok(out) => serde_json::to_value(out)
                    .map_err(|e| invocation_error(e.to_string())),
                Err(e) => Err(e),
            }
        })
    }
}

/// Internal error carrying the failure message under `data.exc.msg`, the
/// shape replies use for handler faults.
pub(crate) fn invocation_error(msg: impl Into<String>) -> RpcError {
    RpcError::internal().with_data(json!({"exc": {"msg": msg.into()}}))
}

/// Registry mapping method names to handlers. Registering a name twice
/// replaces the earlier handler.
#[derive(Default)]
pub struct Registry {
    methods: HashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, T, R, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        Fut: Future<Output = std::result::Result<R, RpcError>> + Send + 'static,
    {
        let method = method.into();
        tracing::debug!(%method, "registering handler");
        self.methods
            .insert(method, Arc::new(TypedHandler::new(handler)));
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(method).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plus(xs: Vec<i64>) -> impl Future<Output = std::result::Result<i64, RpcError>> {
        async move { Ok(xs.first().copied().unwrap_or(0) + xs.get(1).copied().unwrap_or(0)) }
    }

    #[tokio::test]
    async fn dispatches_typed_params() {
        let mut registry = Registry::new();
        registry.register("plus", plus);

        let handler = registry.get("plus").unwrap();
        let out = handler.call(Some(json!([1, 2, 3]))).await;
        assert_eq!(out, Ok(json!(3)));
    }

    #[tokio::test]
    async fn bad_params_become_internal_error() {
        let mut registry = Registry::new();
        registry.register("plus", plus);

        let handler = registry.get("plus").unwrap();
        let err = handler.call(Some(json!("nope"))).await.unwrap_err();
        assert_eq!(err.code, crate::protocol::codes::INTERNAL_ERROR);
        assert!(err.data.unwrap()["exc"]["msg"].is_string());
    }

    #[tokio::test]
    async fn missing_params_deserialize_from_null() {
        let mut registry = Registry::new();
        registry.register("unit", |_: Option<Value>| async move {
            Ok::<_, RpcError>("ok")
        });

        let handler = registry.get("unit").unwrap();
        assert_eq!(handler.call(None).await, Ok(json!("ok")));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let mut registry = Registry::new();
        registry.register("v", |_: Option<Value>| async move { Ok::<_, RpcError>(1) });
        registry.register("v", |_: Option<Value>| async move { Ok::<_, RpcError>(2) });

        let handler = registry.get("v").unwrap();
        assert_eq!(handler.call(None).await, Ok(json!(2)));
    }

    #[test]
    fn unknown_method_is_absent() {
        let registry = Registry::new();
        assert!(registry.get("nope").is_none());
    }
}
