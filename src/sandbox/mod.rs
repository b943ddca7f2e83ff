//! Rule sandbox — isolated execution of user-authored rule scripts.
//!
//! Rules are untrusted text. Each script exposes up to two hooks:
//!
//! - `validate(entry, ctx)` — once per feed entry, decides admission
//! - `describe(entry, file, ctx)` — once per produced file, classifies it
//!
//! Scripts run in a capability-restricted engine: no filesystem, network,
//! process, or ambient host state, only the values the host marshals in by
//! value (entry, file, context maps). Every call is independently bounded by
//! an operation limit and a wall-clock deadline enforced through the engine's
//! progress hook, so a runaway script terminates itself rather than blocking
//! the scheduler. Failure is contained at single-call granularity: a broken
//! `validate` rejects that one entry, a broken `describe` leaves that one file
//! undescribed, and sibling calls are never affected.
//!
//! A rule may alternatively reference host-trusted hooks with a
//! `module:exportName` delegate string; see [`hooks::RuleHooks`].

mod hooks;

pub use hooks::RuleHooks;

use regex::Regex;
use rhai::{AST, Dynamic, Engine, EvalAltResult, Scope};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::types::{DownloadedFile, Entry, FileDescriptor};

/// Delegate references are a single line of the form `module:exportName`
static DELEGATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9_.-]+:[A-Za-z0-9_]+$").expect("delegate pattern is valid")
});

/// Host-side context passed to every hook call, marshaled by value
#[derive(Clone, Debug, Default, Serialize)]
pub struct RuleContext {
    /// Source the entry came from, if any
    pub source_id: Option<i64>,
    /// Rule being evaluated, if persisted
    pub rule_id: Option<i64>,
    /// The rule's free-form `parser_meta` string, opaque to the orchestrator
    pub parser_meta: Option<String>,
}

/// Loads rule scripts into isolated VMs and owns the delegate registry
pub struct RuleSandbox {
    budgets: SandboxConfig,
    modules: Arc<RwLock<HashMap<String, Arc<dyn RuleHooks>>>>,
}

impl RuleSandbox {
    /// Create a sandbox with the given resource budgets
    pub fn new(budgets: SandboxConfig) -> Self {
        Self {
            budgets,
            modules: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a host-trusted hook set under a `module:exportName` key
    pub fn register_module(&self, key: &str, hooks: Arc<dyn RuleHooks>) {
        if let Ok(mut modules) = self.modules.write() {
            modules.insert(key.to_string(), hooks);
        }
    }

    /// Load a rule's script text into an isolated VM.
    ///
    /// A single-line `module:exportName` script resolves to a registered
    /// delegate; anything else is compiled as untrusted script under the
    /// compile budget. Compilation failures and unknown delegates yield
    /// [`SandboxError::Compile`] with the raw diagnostic — callers persist it
    /// as a parse-log/rule error rather than crashing the scheduler.
    pub async fn load(&self, script: &str) -> Result<RuleVm> {
        let trimmed = script.trim();

        if DELEGATE_RE.is_match(trimmed) {
            let hooks = self
                .modules
                .read()
                .ok()
                .and_then(|modules| modules.get(trimmed).cloned())
                .ok_or_else(|| SandboxError::Compile {
                    message: format!("unknown delegate hook: {}", trimmed),
                })?;
            debug!(delegate = trimmed, "Loaded delegate rule");
            return Ok(RuleVm {
                kind: VmKind::Delegate {
                    hooks,
                    key: trimmed.to_string(),
                },
                budgets: self.budgets.clone(),
            });
        }

        // Compile once up front to surface syntax errors at load time. The
        // compiled AST is deliberately not cached beyond the VM: scripts are
        // read at evaluation time, so edits take effect on the next tick.
        let text = trimmed.to_string();
        let max_operations = self.budgets.max_operations;
        let compile = tokio::task::spawn_blocking(move || -> Result<AST> {
            let engine = build_engine(max_operations, None);
            let ast = engine.compile(&text).map_err(|e| SandboxError::Compile {
                message: e.to_string(),
            })?;
            Ok(ast)
        });

        let ast = match tokio::time::timeout(self.budgets.compile_timeout, compile).await {
            Ok(joined) => joined.map_err(|e| SandboxError::Compile {
                message: format!("compile thread panicked: {}", e),
            })??,
            Err(_) => {
                return Err(SandboxError::Compile {
                    message: format!(
                        "compile budget ({:?}) exceeded",
                        self.budgets.compile_timeout
                    ),
                }
                .into());
            }
        };

        Ok(RuleVm {
            kind: VmKind::Script { ast: Arc::new(ast) },
            budgets: self.budgets.clone(),
        })
    }
}

enum VmKind {
    Script { ast: Arc<AST> },
    Delegate { hooks: Arc<dyn RuleHooks>, key: String },
}

/// An isolated VM holding one loaded rule.
///
/// The VM owns its execution context; dropping it (or calling
/// [`RuleVm::release`]) tears the context down on every exit path — the
/// scoped-resource discipline the loader relies on.
pub struct RuleVm {
    kind: VmKind,
    budgets: SandboxConfig,
}

impl std::fmt::Debug for RuleVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            VmKind::Script { .. } => "Script",
            VmKind::Delegate { key, .. } => key.as_str(),
        };
        f.debug_struct("RuleVm")
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

impl RuleVm {
    /// Run the `validate` hook for one feed entry.
    ///
    /// Timeouts and runtime errors are logged and resolve to `false` — the
    /// entry is rejected, siblings are unaffected, nothing escalates.
    pub async fn validate(&self, entry: &Entry, ctx: &RuleContext) -> bool {
        match self.try_validate(entry, ctx).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(rule_id = ?ctx.rule_id, error = %e, "validate hook failed, rejecting entry");
                false
            }
        }
    }

    /// Run the `validate` hook, surfacing the sandbox error to the caller
    pub async fn try_validate(
        &self,
        entry: &Entry,
        ctx: &RuleContext,
    ) -> std::result::Result<bool, SandboxError> {
        match &self.kind {
            VmKind::Delegate { hooks, key } => {
                let call = hooks.validate(entry, ctx);
                match tokio::time::timeout(self.budgets.validate_timeout, call).await {
                    Ok(Ok(accepted)) => Ok(accepted),
                    Ok(Err(e)) => Err(SandboxError::HookRuntime {
                        hook: "validate",
                        message: format!("delegate {}: {}", key, e),
                    }),
                    Err(_) => Err(SandboxError::HookTimeout {
                        hook: "validate",
                        budget_ms: self.budgets.validate_timeout.as_millis() as u64,
                    }),
                }
            }
            VmKind::Script { ast, .. } => {
                let result = self
                    .call_script_hook(
                        ast.clone(),
                        "validate",
                        self.budgets.validate_timeout,
                        vec![to_dynamic("validate", entry)?, to_dynamic("validate", ctx)?],
                    )
                    .await?;

                match result {
                    // No validate hook in the script: nothing is admitted.
                    None => Ok(false),
                    Some(value) => Ok(value.as_bool().unwrap_or(false)),
                }
            }
        }
    }

    /// Run the `describe` hook for one produced file.
    ///
    /// Timeouts and runtime errors are logged and resolve to `None` — the
    /// file is kept but left undescribed.
    pub async fn describe(
        &self,
        entry: &Entry,
        file: &DownloadedFile,
        ctx: &RuleContext,
    ) -> Option<FileDescriptor> {
        match self.try_describe(entry, file, ctx).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(rule_id = ?ctx.rule_id, error = %e, "describe hook failed, leaving file undescribed");
                None
            }
        }
    }

    /// Run the `describe` hook, surfacing the sandbox error to the caller
    pub async fn try_describe(
        &self,
        entry: &Entry,
        file: &DownloadedFile,
        ctx: &RuleContext,
    ) -> std::result::Result<Option<FileDescriptor>, SandboxError> {
        match &self.kind {
            VmKind::Delegate { hooks, key } => {
                let call = hooks.describe(entry, file, ctx);
                match tokio::time::timeout(self.budgets.describe_timeout, call).await {
                    Ok(Ok(descriptor)) => Ok(descriptor),
                    Ok(Err(e)) => Err(SandboxError::HookRuntime {
                        hook: "describe",
                        message: format!("delegate {}: {}", key, e),
                    }),
                    Err(_) => Err(SandboxError::HookTimeout {
                        hook: "describe",
                        budget_ms: self.budgets.describe_timeout.as_millis() as u64,
                    }),
                }
            }
            VmKind::Script { ast, .. } => {
                let result = self
                    .call_script_hook(
                        ast.clone(),
                        "describe",
                        self.budgets.describe_timeout,
                        vec![
                            to_dynamic("describe", entry)?,
                            to_dynamic("describe", file)?,
                            to_dynamic("describe", ctx)?,
                        ],
                    )
                    .await?;

                let Some(value) = result else {
                    return Ok(None);
                };
                if value.is_unit() {
                    return Ok(None);
                }

                let descriptor: FileDescriptor =
                    rhai::serde::from_dynamic(&value).map_err(|e| SandboxError::HookRuntime {
                        hook: "describe",
                        message: format!("descriptor shape invalid: {}", e),
                    })?;
                Ok(Some(descriptor))
            }
        }
    }

    /// Deterministically tear down the VM's execution context.
    ///
    /// Consuming the VM makes double-release unrepresentable; dropping it has
    /// the same effect on paths that unwind early.
    pub fn release(self) {
        if let VmKind::Delegate { key, .. } = &self.kind {
            debug!(delegate = %key, "Released delegate rule VM");
        }
    }

    /// Invoke one hook function inside a fresh, deadline-bounded engine on a
    /// blocking thread. Returns `None` when the script does not define the
    /// hook at all.
    async fn call_script_hook(
        &self,
        ast: Arc<AST>,
        hook: &'static str,
        budget: Duration,
        args: Vec<Dynamic>,
    ) -> std::result::Result<Option<Dynamic>, SandboxError> {
        // Absent hook: resolved without spinning up an engine.
        let arity = args.len();
        let defined = ast
            .iter_functions()
            .any(|f| f.name == hook && f.params.len() == arity);
        if !defined {
            debug!(hook, "script does not define hook");
            return Ok(None);
        }

        let max_operations = self.budgets.max_operations;
        let budget_ms = budget.as_millis() as u64;

        let outcome = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + budget;
            let engine = build_engine(max_operations, Some(deadline));
            let mut scope = Scope::new();
            engine.call_fn::<Dynamic>(&mut scope, &ast, hook, args)
        })
        .await
        .map_err(|e| SandboxError::HookRuntime {
            hook,
            message: format!("sandbox thread panicked: {}", e),
        })?;

        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(err) => match *err {
                // Terminated by the deadline progress hook or the operation quota
                EvalAltResult::ErrorTerminated(..) | EvalAltResult::ErrorTooManyOperations(..) => {
                    Err(SandboxError::HookTimeout { hook, budget_ms })
                }
                other => Err(SandboxError::HookRuntime {
                    hook,
                    message: other.to_string(),
                }),
            },
        }
    }
}

fn to_dynamic<T: Serialize>(
    hook: &'static str,
    value: &T,
) -> std::result::Result<Dynamic, SandboxError> {
    rhai::serde::to_dynamic(value).map_err(|e| SandboxError::HookRuntime {
        hook,
        message: format!("failed to marshal host value: {}", e),
    })
}

/// Build a restricted engine for one evaluation.
///
/// A fresh engine per call means no state leaks between calls, between rules,
/// or between entries — the only host surface a script sees is the marshaled
/// arguments.
fn build_engine(max_operations: u64, deadline: Option<Instant>) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(max_operations);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(32);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);

    if let Some(deadline) = deadline {
        engine.on_progress(move |ops| {
            // Check the wall clock every 256 operations to keep the hook cheap
            if ops % 256 == 0 && Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
    }

    engine
}
