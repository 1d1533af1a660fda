//! Dotted-name command routing for incoming requests.
//!
//! A command `calculator.add` first runs the root router's middlewares, then
//! looks for a handler named `calculator.add` on the root; failing that it
//! splits at the first dot and hands `add` to the `calculator` sub-router,
//! which runs its own middlewares and repeats the lookup.

use crate::error::Error;
use crate::peer::{Handler, Peer};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rmb_common::envelope::ErrorBody;
use rmb_common::types::DEFAULT_SCHEMA;
use rmb_common::{Envelope, TwinId};
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

type HandlerFn =
    Arc<dyn Fn(Context, Arc<[u8]>) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync>;
type MiddlewareFn =
    Arc<dyn Fn(Context, Arc<[u8]>) -> BoxFuture<'static, anyhow::Result<Context>> + Send + Sync>;

/// Request-scoped data passed to middlewares and handlers.
#[derive(Clone)]
pub struct Context {
    twin: TwinId,
    envelope: Arc<Envelope>,
    values: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("twin", &self.twin)
            .field("uid", &self.envelope.uid)
            .field("values", &self.values.len())
            .finish()
    }
}

impl Context {
    /// Context for a verified request envelope.
    #[must_use]
    pub fn new(envelope: Arc<Envelope>) -> Self {
        Self {
            twin: envelope.source_twin().unwrap_or_default(),
            envelope,
            values: Arc::default(),
        }
    }

    /// Twin that sent the request.
    #[must_use]
    pub fn twin(&self) -> TwinId {
        self.twin
    }

    /// The request envelope, payload already decrypted.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Returns a context carrying `value`, replacing any earlier value of
    /// the same type.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(mut self, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), Arc::new(value));
        self.values = Arc::new(values);
        self
    }

    /// A value stored by a middleware.
    #[must_use]
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }
}

/// Handler failure carrying an explicit error code for the remote caller.
///
/// Any other error returned by a handler is reported with code 0.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Code sent in the error envelope.
    pub code: u32,
    /// Message sent in the error envelope.
    pub message: String,
}

impl HandlerError {
    /// New handler error.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A tree of named handlers with per-level middlewares.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, HandlerFn>,
    children: HashMap<String, Router>,
    middlewares: Vec<MiddlewareFn>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("Router")
            .field("handlers", &handlers)
            .field("children", &self.children)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl Router {
    /// Empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`. Its return value is sent back as
    /// JSON.
    ///
    /// # Panics
    ///
    /// If a handler is already registered under `name`.
    pub fn with_handler<F, Fut, R>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Arc<[u8]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        assert!(
            !self.handlers.contains_key(name),
            "handler function '{name}' is already registered"
        );
        let wrapped: HandlerFn = Arc::new(
            move |ctx: Context, payload: Arc<[u8]>| -> BoxFuture<'static, anyhow::Result<Vec<u8>>> {
                let fut = handler(ctx, payload);
                Box::pin(async move {
                    let value = fut.await?;
                    Ok(serde_json::to_vec(&value)?)
                })
            },
        );
        self.handlers.insert(name.to_string(), wrapped);
        self
    }

    /// Returns the sub-router for `prefix`, creating it on first use.
    ///
    /// # Panics
    ///
    /// If `prefix` contains a `.`.
    pub fn sub_route(&mut self, prefix: &str) -> &mut Router {
        assert!(
            !prefix.contains('.'),
            "invalid prefix '{prefix}': must not contain '.'"
        );
        self.children.entry(prefix.to_string()).or_default()
    }

    /// Appends a middleware run, in registration order, before any handler
    /// lookup at this level. An error aborts the request.
    pub fn use_middleware<F, Fut>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Context, Arc<[u8]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Context>> + Send + 'static,
    {
        self.middlewares.push(Arc::new(
            move |ctx: Context, payload: Arc<[u8]>| -> BoxFuture<'static, anyhow::Result<Context>> {
                Box::pin(middleware(ctx, payload))
            },
        ));
        self
    }

    /// Dispatches `command` and returns the handler's JSON output.
    ///
    /// # Errors
    ///
    /// A middleware or handler error, a caught handler panic, or
    /// [`Error::FunctionNotFound`].
    pub fn call<'a>(
        &'a self,
        ctx: Context,
        command: &'a str,
        payload: Arc<[u8]>,
    ) -> BoxFuture<'a, anyhow::Result<Vec<u8>>> {
        Box::pin(async move {
            let mut ctx = ctx;
            for middleware in &self.middlewares {
                ctx = middleware(ctx, Arc::clone(&payload)).await?;
            }

            if let Some(handler) = self.handlers.get(command) {
                let handler = Arc::clone(handler);
                return match AssertUnwindSafe(async move { handler(ctx, payload).await })
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => Err(anyhow::anyhow!(
                        "handler panicked with: {}",
                        panic_message(panic.as_ref())
                    )),
                };
            }

            let (prefix, rest) = command.split_once('.').unwrap_or((command, ""));
            match self.children.get(prefix) {
                Some(child) => child.call(ctx, rest, payload).await,
                None => Err(Error::FunctionNotFound.into()),
            }
        })
    }

    async fn serve(&self, peer: Peer, envelope: Envelope) {
        let Some(request) = envelope.request() else {
            error!(uid = %envelope.uid, "received a non request envelope");
            return;
        };
        if envelope.schema.as_deref() != Some(DEFAULT_SCHEMA) {
            error!(uid = %envelope.uid, schema = ?envelope.schema, "invalid schema received expected '{DEFAULT_SCHEMA}'");
            return;
        }
        let Some(plain) = envelope.plain() else {
            warn!(uid = %envelope.uid, "payload is not in plain format");
            return;
        };
        let Some(source) = envelope.source.clone() else {
            return;
        };

        let command = request.command.clone();
        let payload: Arc<[u8]> = Arc::from(plain);
        let uid = envelope.uid.clone();
        let ctx = Context::new(Arc::new(envelope));

        let (error, data) = match self.call(ctx, &command, payload).await {
            Ok(data) => (None, data),
            Err(err) => {
                debug!(uid = %uid, command = %command, error = %format!("{err:#}"), "handler failed");
                (Some(error_body(&err)), b"null".to_vec())
            }
        };

        let twin = source.twin;
        if let Err(e) = peer.send_response(&uid, source, error, &data).await {
            error!(uid = %uid, twin, error = %e, "failed to send response");
        }
    }
}

impl Handler for Router {
    fn handle(self: Arc<Self>, peer: &Peer, envelope: Envelope, error: Option<Error>) {
        if let Some(err) = error {
            error!(uid = %envelope.uid, error = %err, "bad request");
            return;
        }
        let peer = peer.clone();
        tokio::spawn(async move { self.serve(peer, envelope).await });
    }
}

fn error_body(err: &anyhow::Error) -> ErrorBody {
    ErrorBody {
        code: err.downcast_ref::<HandlerError>().map_or(0, |e| e.code),
        message: format!("{err:#}"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmb_common::envelope::{Body, Payload, Request};
    use rmb_common::Address;
    use std::sync::Mutex;

    fn ctx() -> Context {
        Context::new(Arc::new(Envelope {
            uid: "u".into(),
            source: Some(Address::twin(9)),
            body: Some(Body::Request(Request {
                command: "x".into(),
            })),
            payload: Some(Payload::Plain(b"{}".to_vec())),
            ..Envelope::default()
        }))
    }

    fn payload(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    fn calculator() -> Router {
        let mut router = Router::new();
        router
            .sub_route("calculator")
            .with_handler("add", |_ctx, payload: Arc<[u8]>| async move {
                let [a, b]: [f64; 2] = serde_json::from_slice(&payload)?;
                anyhow::Ok(a + b)
            })
            .with_handler("divide", |_ctx, payload: Arc<[u8]>| async move {
                let [a, b]: [f64; 2] = serde_json::from_slice(&payload)?;
                if b == 0.0 {
                    return Err(HandlerError::new(400, "cannot divide by zero").into());
                }
                anyhow::Ok(a / b)
            });
        router
    }

    #[tokio::test]
    async fn dispatches_to_sub_route() {
        let out = calculator()
            .call(ctx(), "calculator.add", payload("[2, 3]"))
            .await
            .unwrap();
        assert_eq!(out, b"5.0");
    }

    #[tokio::test]
    async fn nested_sub_routes() {
        let mut router = Router::new();
        router
            .sub_route("a")
            .sub_route("b")
            .with_handler("c", |_ctx, payload: Arc<[u8]>| async move {
                anyhow::Ok(String::from_utf8(payload.to_vec())?)
            });
        let out = router.call(ctx(), "a.b.c", payload("hi")).await.unwrap();
        assert_eq!(out, br#""hi""#);
        let err = router.call(ctx(), "a.b.d", payload("")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::FunctionNotFound)));
    }

    #[tokio::test]
    async fn exact_name_wins_over_prefix() {
        let mut router = calculator();
        router.with_handler("calculator.add", |_ctx, _p| async { anyhow::Ok("flat") });
        let out = router
            .call(ctx(), "calculator.add", payload("[1, 1]"))
            .await
            .unwrap();
        assert_eq!(out, br#""flat""#);
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let router = calculator();
        for command in ["calculator.mul", "calculator", "other.add", ""] {
            let err = router.call(ctx(), command, payload("[]")).await.unwrap_err();
            assert_eq!(err.to_string(), "function is not found", "{command}");
        }
    }

    #[tokio::test]
    async fn handler_error_keeps_code() {
        let err = calculator()
            .call(ctx(), "calculator.divide", payload("[1, 0]"))
            .await
            .unwrap_err();
        let body = error_body(&err);
        assert_eq!(body.code, 400);
        assert_eq!(body.message, "cannot divide by zero");
    }

    #[tokio::test]
    async fn plain_errors_get_code_zero() {
        let err = calculator()
            .call(ctx(), "calculator.add", payload("not json"))
            .await
            .unwrap_err();
        assert_eq!(error_body(&err).code, 0);
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let mut router = Router::new();
        router.with_handler("boom", |_ctx, _p| async {
            if true {
                panic!("kaput");
            }
            anyhow::Ok(())
        });
        let err = router.call(ctx(), "boom", payload("")).await.unwrap_err();
        assert_eq!(err.to_string(), "handler panicked with: kaput");
    }

    #[tokio::test]
    async fn middlewares_run_in_order_per_level() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        for tag in ["root-1", "root-2"] {
            let seen = Arc::clone(&seen);
            router.use_middleware(move |ctx, _p| {
                seen.lock().unwrap().push(tag);
                async move { anyhow::Ok(ctx) }
            });
        }
        let seen_sub = Arc::clone(&seen);
        let seen_handler = Arc::clone(&seen);
        router
            .sub_route("svc")
            .use_middleware(move |ctx: Context, _p| {
                seen_sub.lock().unwrap().push("svc");
                async move { anyhow::Ok(ctx.with_value(7u32)) }
            })
            .with_handler("get", move |ctx: Context, _p| {
                seen_handler.lock().unwrap().push("handler");
                let value = ctx.value::<u32>().copied();
                async move { anyhow::Ok(value) }
            });

        let out = router.call(ctx(), "svc.get", payload("")).await.unwrap();
        assert_eq!(out, b"7");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["root-1", "root-2", "svc", "handler"]
        );
    }

    #[tokio::test]
    async fn middleware_error_aborts() {
        let mut router = calculator();
        router.use_middleware(|ctx: Context, _p| async move {
            if ctx.twin() == 9 {
                anyhow::bail!("twin 9 is not allowed");
            }
            anyhow::Ok(ctx)
        });
        let err = router
            .call(ctx(), "calculator.add", payload("[1, 2]"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "twin 9 is not allowed");
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_handler_panics() {
        let mut router = Router::new();
        router.with_handler("a", |_c, _p| async { anyhow::Ok(()) });
        router.with_handler("a", |_c, _p| async { anyhow::Ok(()) });
    }

    #[test]
    #[should_panic(expected = "must not contain '.'")]
    fn dotted_prefix_panics() {
        Router::new().sub_route("a.b");
    }

    #[test]
    fn context_values_are_typed() {
        let ctx = ctx().with_value("who").with_value(3u8);
        assert_eq!(ctx.value::<&str>(), Some(&"who"));
        assert_eq!(ctx.value::<u8>(), Some(&3));
        assert_eq!(ctx.value::<u16>(), None);
        assert_eq!(ctx.twin(), 9);
        assert_eq!(ctx.envelope().uid, "u");
    }
}
