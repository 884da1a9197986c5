//! Mutator registry.
//!
//! Handlers are registered explicitly at startup under `namespace|name`.
//! Each entry carries an ordered list of parameter bindings that turn the
//! incoming mutation into the handler's arguments.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tributary_engine::document::get_path;
use tributary_engine::Mutation;

use crate::error::StoreError;

/// Why a mutator could not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum MutatorError {
    #[error("unknown mutator '{0}'")]
    Unknown(String),

    #[error("cannot bind parameter: {0}")]
    Binding(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("{0}")]
    Failed(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("mutator '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid mutator name '{0}'")]
    InvalidName(String),
}

/// What a binding sees of the mutation being processed.
#[derive(Debug, Clone, Copy)]
pub struct MutationContext<'a> {
    pub client_group_id: &'a str,
    pub mutation: &'a Mutation,
}

type Binding = dyn Fn(&MutationContext<'_>) -> Result<Value, MutatorError> + Send + Sync;

/// One handler argument, extracted from the mutation.
#[derive(Clone)]
pub struct Param(Arc<Binding>);

impl Param {
    /// All arguments as an array.
    pub fn args() -> Self {
        Self::custom(|ctx| Ok(Value::Array(ctx.mutation.args.clone())))
    }

    /// The argument at `index`.
    pub fn arg(index: usize) -> Self {
        Self::custom(move |ctx| {
            ctx.mutation
                .args
                .get(index)
                .cloned()
                .ok_or_else(|| MutatorError::Binding(format!("missing argument {index}")))
        })
    }

    /// A dot path into the object argument at `index`.
    pub fn arg_path(index: usize, path: impl Into<String>) -> Self {
        let path = path.into();
        Self::custom(move |ctx| {
            let arg = ctx
                .mutation
                .args
                .get(index)
                .ok_or_else(|| MutatorError::Binding(format!("missing argument {index}")))?;
            arg.as_object()
                .and_then(|object| get_path(object, &path))
                .cloned()
                .ok_or_else(|| MutatorError::Binding(format!("argument {index} has no '{path}'")))
        })
    }

    pub fn client_id() -> Self {
        Self::custom(|ctx| Ok(Value::String(ctx.mutation.client_id.clone())))
    }

    pub fn client_group_id() -> Self {
        Self::custom(|ctx| Ok(Value::String(ctx.client_group_id.to_string())))
    }

    pub fn mutation_id() -> Self {
        Self::custom(|ctx| Ok(Value::from(ctx.mutation.id)))
    }

    pub fn custom<F>(bind: F) -> Self
    where
        F: Fn(&MutationContext<'_>) -> Result<Value, MutatorError> + Send + Sync + 'static,
    {
        Self(Arc::new(bind))
    }

    pub fn bind(&self, ctx: &MutationContext<'_>) -> Result<Value, MutatorError> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Param")
    }
}

/// A mutation handler running inside the mutation's transaction.
pub type Handler<Tx> =
    Arc<dyn for<'t> Fn(&'t mut Tx, Vec<Value>) -> BoxFuture<'t, Result<Value, MutatorError>> + Send + Sync>;

struct Entry<Tx> {
    handler: Handler<Tx>,
    params: Vec<Param>,
}

/// Handlers by `namespace|name`, fixed after startup.
pub struct MutatorRegistry<Tx> {
    entries: HashMap<String, Entry<Tx>>,
}

impl<Tx> Default for MutatorRegistry<Tx> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Tx> MutatorRegistry<Tx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as `namespace|name`.
    pub fn register<F>(
        &mut self,
        namespace: &str,
        name: &str,
        params: Vec<Param>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: for<'t> Fn(&'t mut Tx, Vec<Value>) -> BoxFuture<'t, Result<Value, MutatorError>>
            + Send
            + Sync
            + 'static,
    {
        if namespace.is_empty() || name.is_empty() || namespace.contains('|') || name.contains('|') {
            return Err(RegistryError::InvalidName(format!("{namespace}|{name}")));
        }
        let key = format!("{namespace}|{name}");
        if self.entries.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        tracing::debug!(mutator = %key, params = params.len(), "mutator registered");
        self.entries.insert(
            key,
            Entry {
                handler: Arc::new(handler),
                params,
            },
        );
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bind the mutation's parameters and run its handler in `tx`.
    pub async fn dispatch(&self, tx: &mut Tx, ctx: &MutationContext<'_>) -> Result<Value, MutatorError> {
        let name = ctx.mutation.name.as_str();
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| MutatorError::Unknown(name.to_string()))?;
        let args = entry
            .params
            .iter()
            .map(|param| param.bind(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        (entry.handler)(tx, args).await
    }
}
