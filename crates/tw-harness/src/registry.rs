use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::tool::{ToolCategory, ToolDefinition, ToolHandler};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool already registered: `{0}`")]
    Duplicate(String),
    #[error("tool not found: `{0}`")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The result of [`ToolRegistry::execute`]. Handler errors never escape as
/// `Err`; they are folded into a failed outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    /// Higher priority tools sort first in the advertised definition list.
    pub priority: i32,
    /// Replace an existing registration instead of failing.
    pub override_existing: bool,
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
    priority: i32,
}

/// Name→handler map with categories, priority ordering and execution stats.
///
/// Reads vastly outnumber writes: registration is rare and guarded, readers
/// observe either the old or the new handler set. The advertised definition
/// list is cached and the cache is invalidated by any mutation.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    definitions_cache: Mutex<Option<Arc<Vec<ToolDefinition>>>>,
    per_tool_stats: DashMap<String, ToolStats>,
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            definitions_cache: Mutex::new(None),
            per_tool_stats: DashMap::new(),
            executions: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn invalidate_cache(&self) {
        *self
            .definitions_cache
            .lock()
            .expect("definitions cache lock poisoned") = None;
    }

    /// Register a tool. Fails on duplicates unless `override_existing`.
    pub fn register(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
        options: RegisterOptions,
    ) -> Result<(), RegistryError> {
        let name = definition.name.clone();
        {
            let mut tools = self.tools.write().expect("tool map lock poisoned");
            if tools.contains_key(&name) && !options.override_existing {
                return Err(RegistryError::Duplicate(name));
            }
            tools.insert(
                name.clone(),
                RegisteredTool {
                    definition,
                    handler,
                    priority: options.priority,
                },
            );
        }
        self.invalidate_cache();
        debug!(tool = %name, "registered tool");
        Ok(())
    }

    /// Register several tools at once, silently skipping entries with no
    /// handler.
    pub fn register_batch(
        &self,
        entries: Vec<(ToolDefinition, Option<Arc<dyn ToolHandler>>)>,
        options: RegisterOptions,
    ) -> usize {
        let mut registered = 0;
        for (definition, handler) in entries {
            let Some(handler) = handler else {
                debug!(tool = %definition.name, "skipping tool with missing handler");
                continue;
            };
            match self.register(definition, handler, options) {
                Ok(()) => registered += 1,
                Err(RegistryError::Duplicate(name)) => {
                    debug!(tool = %name, "skipping duplicate in batch");
                }
                Err(e) => warn!(error = %e, "batch registration error"),
            }
        }
        registered
    }

    pub fn unregister(&self, name: &str) -> Result<ToolDefinition, RegistryError> {
        let removed = {
            let mut tools = self.tools.write().expect("tool map lock poisoned");
            tools.remove(name)
        };
        match removed {
            Some(tool) => {
                self.invalidate_cache();
                self.per_tool_stats.remove(name);
                Ok(tool.definition)
            }
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Remove every tool in a category. Returns the number removed.
    pub fn unregister_category(&self, category: ToolCategory) -> usize {
        let removed: Vec<String> = {
            let mut tools = self.tools.write().expect("tool map lock poisoned");
            let names: Vec<String> = tools
                .iter()
                .filter(|(_, t)| t.definition.category == category)
                .map(|(n, _)| n.clone())
                .collect();
            for name in &names {
                tools.remove(name);
            }
            names
        };
        for name in &removed {
            self.per_tool_stats.remove(name);
        }
        if !removed.is_empty() {
            self.invalidate_cache();
        }
        removed.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool map lock poisoned")
            .contains_key(name)
    }

    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools
            .read()
            .expect("tool map lock poisoned")
            .get(name)
            .map(|t| t.definition.clone())
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("tool map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Definitions sorted by descending priority (name as tiebreak for a
    /// stable order). The list is cached until the next mutation.
    pub fn get_definitions(&self) -> Arc<Vec<ToolDefinition>> {
        {
            let cache = self
                .definitions_cache
                .lock()
                .expect("definitions cache lock poisoned");
            if let Some(defs) = cache.as_ref() {
                return Arc::clone(defs);
            }
        }

        let mut entries: Vec<(i32, ToolDefinition)> = {
            let tools = self.tools.read().expect("tool map lock poisoned");
            tools
                .values()
                .map(|t| (t.priority, t.definition.clone()))
                .collect()
        };
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        let defs = Arc::new(entries.into_iter().map(|(_, d)| d).collect::<Vec<_>>());

        let mut cache = self
            .definitions_cache
            .lock()
            .expect("definitions cache lock poisoned");
        *cache = Some(Arc::clone(&defs));
        defs
    }

    /// Execute a registered tool by name. Never returns `Err`: unknown tools
    /// and handler failures come back as failed outcomes.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> ToolOutcome {
        let handler = {
            let tools = self.tools.read().expect("tool map lock poisoned");
            tools.get(name).map(|t| Arc::clone(&t.handler))
        };

        let Some(handler) = handler else {
            return ToolOutcome::err(format!("tool not found: {name}"));
        };

        self.executions.fetch_add(1, Ordering::Relaxed);
        let outcome = match handler.execute(input).await {
            Ok(output) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                ToolOutcome::ok(output)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                ToolOutcome::err(e.to_string())
            }
        };

        let mut entry = self.per_tool_stats.entry(name.to_string()).or_default();
        entry.calls += 1;
        if outcome.success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }

        outcome
    }

    pub fn tool_stats(&self, name: &str) -> ToolStats {
        self.per_tool_stats
            .get(name)
            .map(|s| *s)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.len(),
            executions: self.executions.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Independent copy of the registrations with zeroed stats. Handlers are
    /// shared through their `Arc`s.
    pub fn clone_with_fresh_stats(&self) -> ToolRegistry {
        let clone = ToolRegistry::new();
        {
            let source = self.tools.read().expect("tool map lock poisoned");
            let mut target = clone.tools.write().expect("tool map lock poisoned");
            for (name, tool) in source.iter() {
                target.insert(
                    name.clone(),
                    RegisteredTool {
                        definition: tool.definition.clone(),
                        handler: Arc::clone(&tool.handler),
                        priority: tool.priority,
                    },
                );
            }
        }
        clone
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
