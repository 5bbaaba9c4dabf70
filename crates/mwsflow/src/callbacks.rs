//! Named, typed callback handlers.
//!
//! An entry stores a [`CallbackDescriptor`] (handler name, JSON argument and
//! the argument's Rust type name) instead of a live closure, so delivery
//! survives a process restart as long as the same handlers are registered on
//! startup.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{CallbackError, EnqueueError};
use crate::jobs::model::{CallbackDescriptor, JobKind, Owner};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type HandlerFn =
    dyn Fn(Delivery, Value) -> BoxFuture<'static, Result<(), CallbackError>> + Send + Sync;

/// What a handler receives: the downloaded content plus enough context to
/// tell which job it belongs to.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub entry_id: Uuid,
    pub kind: JobKind,
    pub owner: Owner,
    pub remote_id: String,
    pub generated_id: Option<String>,
    pub content: Vec<u8>,
}

impl Delivery {
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.content.as_slice())
    }
}

#[derive(Clone)]
struct HandlerEntry {
    handler: Arc<HandlerFn>,
    argument_type: &'static str,
    timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

#[derive(Clone, Default)]
pub struct CallbackRegistry {
    handlers: HashMap<String, HandlerEntry>,
    default_timeout: Option<Duration>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies to handlers registered without their own timeout.
    pub fn with_default_timeout(mut self, dur: Option<Duration>) -> Self {
        self.default_timeout = dur;
        self
    }

    pub fn register<A, F, Fut>(&mut self, name: &str, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(Delivery, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_with_options(name, handler, HandlerOptions::new());
    }

    pub fn register_with_timeout<A, F, Fut>(&mut self, name: &str, handler: F, dur: Duration)
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(Delivery, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_with_options(name, handler, HandlerOptions::new().timeout(dur));
    }

    pub fn register_with_options<A, F, Fut>(&mut self, name: &str, handler: F, opts: HandlerOptions)
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(Delivery, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler_name = name.to_string();
        let erased = move |delivery: Delivery,
                           argument: Value|
              -> BoxFuture<'static, Result<(), CallbackError>> {
            let handler_name = handler_name.clone();
            let argument: A = match serde_json::from_value(argument) {
                Ok(a) => a,
                Err(source) => {
                    return boxed(async move {
                        Err(CallbackError::BadArgument {
                            handler: handler_name,
                            source,
                        })
                    });
                }
            };
            let fut = handler(delivery, argument);
            boxed(async move {
                fut.await.map_err(|e| CallbackError::Failed {
                    handler: handler_name,
                    message: format!("{e:#}"),
                })
            })
        };

        self.handlers.insert(
            name.to_string(),
            HandlerEntry {
                handler: Arc::new(erased),
                argument_type: type_name::<A>(),
                timeout: opts.timeout,
            },
        );
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the descriptor persisted with a new entry. Fails when the
    /// handler is unknown or registered for a different argument type.
    pub fn describe<A>(&self, handler: &str, argument: &A) -> Result<CallbackDescriptor, EnqueueError>
    where
        A: Serialize + 'static,
    {
        let entry = self
            .handlers
            .get(handler)
            .ok_or_else(|| EnqueueError::UnknownHandler(handler.to_string()))?;

        let actual = type_name::<A>();
        if entry.argument_type != actual {
            return Err(EnqueueError::ArgumentTypeMismatch {
                handler: handler.to_string(),
                expected: entry.argument_type,
                actual,
            });
        }

        Ok(CallbackDescriptor {
            handler: handler.to_string(),
            argument: serde_json::to_value(argument).map_err(EnqueueError::Argument)?,
            argument_type: actual.to_string(),
        })
    }

    /// Resolves the descriptor and runs the handler once.
    pub async fn invoke(
        &self,
        descriptor: &CallbackDescriptor,
        delivery: Delivery,
    ) -> Result<(), CallbackError> {
        let entry = self
            .handlers
            .get(&descriptor.handler)
            .cloned()
            .ok_or_else(|| CallbackError::UnknownHandler(descriptor.handler.clone()))?;

        if entry.argument_type != descriptor.argument_type {
            return Err(CallbackError::ArgumentTypeMismatch {
                handler: descriptor.handler.clone(),
                registered: entry.argument_type,
                persisted: descriptor.argument_type.clone(),
            });
        }

        let handler = entry.handler.clone();
        let argument = descriptor.argument.clone();
        // the handler is called inside the future so a panic while building it is caught too
        let run = AssertUnwindSafe(async move { handler(delivery, argument).await }).catch_unwind();

        let outcome = match entry.timeout.or(self.default_timeout) {
            Some(dur) => match timeout(dur, run).await {
                Ok(inner) => inner,
                Err(_) => {
                    return Err(CallbackError::Timeout {
                        handler: descriptor.handler.clone(),
                        after: dur,
                    })
                }
            },
            None => run.await,
        };

        match outcome {
            Ok(res) => res,
            Err(_) => Err(CallbackError::Panicked {
                handler: descriptor.handler.clone(),
            }),
        }
    }
}

fn boxed<'a, T>(fut: impl Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}
