//! Function runtimes and name resolution.
//!
//! A runtime executes a single function call; a resolver maps human
//! function names to runtime-specific ids within its namespace. The
//! [`Registry`] keys both by runtime name and acts as the meta-resolver:
//! a resolve request fans across every namespace and succeeds iff exactly
//! one returns a hit. Qualified names (`namespace://name`) short-circuit to
//! a single namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::types::invocation::DynamicExpansion;
use crate::value::ValueMap;

/// A resolved function reference. Carries the runtime name so dispatch is
/// unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnRef {
    /// The runtime that executes this function.
    pub runtime: String,
    /// The runtime-specific function id.
    pub id: String,
    /// Whether the runtime supports pre-warming for this function.
    #[serde(default)]
    pub supports_prepare: bool,
}

impl FnRef {
    /// A reference without pre-warm support.
    pub fn new(runtime: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            id: id.into(),
            supports_prepare: false,
        }
    }
}

impl std::fmt::Display for FnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.runtime, self.id)
    }
}

/// A failed function invocation.
///
/// `retryable` marks transport-level failures (connection loss, worker
/// crash); the failure is recorded on the task either way, and the
/// controller is the sole retry authority.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    /// Human-readable description.
    pub message: String,
    /// `true` for transport-level failures.
    pub retryable: bool,
}

impl RuntimeError {
    /// A function-level failure (the function itself errored).
    pub fn function(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// A transport-level failure (the call never completed cleanly).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// What an invocation returned: a value, or a dynamic sub-graph to run in
/// place of the value.
#[derive(Debug, Clone)]
pub enum Invoked {
    /// The function produced an output map.
    Output(ValueMap),
    /// The function expanded into dynamic tasks; the originating task
    /// waits until they all succeed.
    Expansion(DynamicExpansion),
}

/// A function executor reachable by name.
#[async_trait]
pub trait FunctionRuntime: Send + Sync + std::fmt::Debug {
    /// Execute a function with resolved inputs.
    ///
    /// `deadline` is advisory; runtimes should stop work past it and report
    /// a transport error rather than leave the call ambiguous.
    async fn invoke(
        &self,
        fn_ref: &FnRef,
        inputs: ValueMap,
        deadline: Option<OffsetDateTime>,
    ) -> std::result::Result<Invoked, RuntimeError>;

    /// Pre-warm a function expected to run around `expected_at`.
    ///
    /// Best-effort; the default does nothing.
    async fn prepare(&self, _fn_ref: &FnRef, _expected_at: OffsetDateTime) {}

    /// Whether this runtime benefits from pre-warming at all.
    fn supports_prepare(&self) -> bool {
        false
    }
}

/// Maps human function names to function ids within one namespace.
#[async_trait]
pub trait FunctionResolver: Send + Sync {
    /// Resolve a name; `Ok(None)` for a clean miss.
    async fn resolve(&self, name: &str) -> Result<Option<String>>;
}

/// Name-keyed lookup of function runtimes and resolvers.
///
/// Built once at startup and shared behind an `Arc`.
#[derive(Default)]
pub struct Registry {
    runtimes: BTreeMap<String, Arc<dyn FunctionRuntime>>,
    resolvers: BTreeMap<String, Arc<dyn FunctionResolver>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runtime under a namespace name.
    pub fn with_runtime(
        mut self,
        name: impl Into<String>,
        runtime: Arc<dyn FunctionRuntime>,
    ) -> Self {
        self.runtimes.insert(name.into(), runtime);
        self
    }

    /// Register a resolver under a namespace name.
    pub fn with_resolver(
        mut self,
        name: impl Into<String>,
        resolver: Arc<dyn FunctionResolver>,
    ) -> Self {
        self.resolvers.insert(name.into(), resolver);
        self
    }

    /// Look up the runtime a function reference dispatches to.
    pub fn runtime(&self, name: &str) -> Result<Arc<dyn FunctionRuntime>> {
        self.runtimes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownRuntime {
                name: name.to_owned(),
            })
    }

    /// Resolve a function name across namespaces.
    ///
    /// A qualified name (`namespace://name`) consults only that namespace.
    /// Otherwise every resolver is consulted and resolution succeeds iff
    /// exactly one namespace returns a hit.
    pub async fn resolve(&self, name: &str) -> Result<FnRef> {
        if let Some((namespace, bare)) = name.split_once("://") {
            let resolver = self
                .resolvers
                .get(namespace)
                .ok_or_else(|| Error::UnknownRuntime {
                    name: namespace.to_owned(),
                })?;
            return match resolver.resolve(bare).await? {
                Some(id) => Ok(self.fn_ref(namespace, id)),
                None => Err(Error::FunctionNotFound {
                    name: name.to_owned(),
                }),
            };
        }

        let mut hits = Vec::new();
        for (namespace, resolver) in &self.resolvers {
            if let Some(id) = resolver.resolve(name).await? {
                hits.push((namespace.clone(), id));
            }
        }
        match hits.len() {
            0 => Err(Error::FunctionNotFound {
                name: name.to_owned(),
            }),
            1 => {
                let (namespace, id) = hits.remove(0);
                Ok(self.fn_ref(&namespace, id))
            }
            _ => Err(Error::FunctionAmbiguous {
                name: name.to_owned(),
                namespaces: hits.into_iter().map(|(ns, _)| ns).collect(),
            }),
        }
    }

    fn fn_ref(&self, namespace: &str, id: String) -> FnRef {
        let supports_prepare = self
            .runtimes
            .get(namespace)
            .is_some_and(|rt| rt.supports_prepare());
        FnRef {
            runtime: namespace.to_owned(),
            id,
            supports_prepare,
        }
    }
}
