use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ToolCategory
// ---------------------------------------------------------------------------

/// Coarse classification of a tool's effect. Drives default timeouts, the
/// execution-mode guard, and dry-run interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FileRead,
    FileWrite,
    FileDelete,
    ShellCommand,
    GitOperation,
    PackageInstall,
    ServerStart,
    ServerStop,
    Network,
    Test,
    Analysis,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 11] = [
        ToolCategory::FileRead,
        ToolCategory::FileWrite,
        ToolCategory::FileDelete,
        ToolCategory::ShellCommand,
        ToolCategory::GitOperation,
        ToolCategory::PackageInstall,
        ToolCategory::ServerStart,
        ToolCategory::ServerStop,
        ToolCategory::Network,
        ToolCategory::Test,
        ToolCategory::Analysis,
    ];

    /// True for categories that mutate state outside the process.
    pub fn is_side_effecting(&self) -> bool {
        matches!(
            self,
            ToolCategory::FileWrite
                | ToolCategory::FileDelete
                | ToolCategory::ShellCommand
                | ToolCategory::GitOperation
                | ToolCategory::PackageInstall
                | ToolCategory::ServerStart
                | ToolCategory::ServerStop
                | ToolCategory::Network
        )
    }

    /// Default per-call timeout in milliseconds.
    pub fn default_timeout_ms(&self) -> u64 {
        match self {
            ToolCategory::FileRead | ToolCategory::Analysis => 5_000,
            ToolCategory::FileWrite | ToolCategory::FileDelete => 10_000,
            ToolCategory::ShellCommand | ToolCategory::GitOperation => 30_000,
            ToolCategory::ServerStart | ToolCategory::ServerStop => 30_000,
            ToolCategory::PackageInstall => 180_000,
            ToolCategory::Test => 300_000,
            ToolCategory::Network => 30_000,
        }
    }

    /// Whether an operation in this category can be undone afterwards.
    /// Deletes, arbitrary shell commands, and network calls cannot.
    pub fn reversible_by_default(&self) -> bool {
        !matches!(
            self,
            ToolCategory::FileDelete | ToolCategory::ShellCommand | ToolCategory::Network
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCategory::FileRead => "file_read",
            ToolCategory::FileWrite => "file_write",
            ToolCategory::FileDelete => "file_delete",
            ToolCategory::ShellCommand => "shell_command",
            ToolCategory::GitOperation => "git_operation",
            ToolCategory::PackageInstall => "package_install",
            ToolCategory::ServerStart => "server_start",
            ToolCategory::ServerStop => "server_stop",
            ToolCategory::Network => "network",
            ToolCategory::Test => "test",
            ToolCategory::Analysis => "analysis",
        }
    }

    pub fn from_name(name: &str) -> Option<ToolCategory> {
        ToolCategory::ALL.iter().copied().find(|c| c.name() == name)
    }
}

// ---------------------------------------------------------------------------
// ToolDefinition
// ---------------------------------------------------------------------------

/// A tool as advertised to the decision oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub input_schema: serde_json::Value,
    pub category: ToolCategory,
    /// Overrides [`ToolCategory::reversible_by_default`] when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversible: Option<bool>,
    /// Overrides the category default timeout when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({ "type": "object" }),
            category,
            reversible: None,
            timeout_ms: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn irreversible(mut self) -> Self {
        self.reversible = Some(false);
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.reversible
            .unwrap_or_else(|| self.category.reversible_by_default())
    }

    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms
            .unwrap_or_else(|| self.category.default_timeout_ms())
    }
}

// ---------------------------------------------------------------------------
// ToolHandler
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The callable side of a registered tool.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send>>;

/// Adapter turning a closure into a [`ToolHandler`]; keeps registration
/// call-sites short, especially in tests.
pub struct FnHandler<F>
where
    F: Fn(serde_json::Value) -> HandlerFuture + Send + Sync,
{
    f: F,
}

impl FnHandler<Box<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>> {
    /// Wrap an async closure.
    pub fn new<G, Fut>(g: G) -> Self
    where
        G: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ToolError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |input| Box::pin(g(input))),
        }
    }

    /// Wrap a synchronous closure producing a JSON value.
    pub fn sync<G>(g: G) -> Self
    where
        G: Fn(serde_json::Value) -> Result<serde_json::Value, ToolError>
            + Send
            + Sync
            + Clone
            + 'static,
    {
        Self {
            f: Box::new(move |input| {
                let g = g.clone();
                Box::pin(async move { g(input) })
            }),
        }
    }
}

#[async_trait::async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> HandlerFuture + Send + Sync,
{
    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        (self.f)(input).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn side_effect_classification() {
        assert!(!ToolCategory::FileRead.is_side_effecting());
        assert!(!ToolCategory::Analysis.is_side_effecting());
        assert!(!ToolCategory::Test.is_side_effecting());
        assert!(ToolCategory::FileWrite.is_side_effecting());
        assert!(ToolCategory::ShellCommand.is_side_effecting());
        assert!(ToolCategory::Network.is_side_effecting());
    }

    #[test]
    fn default_timeouts_per_category() {
        assert_eq!(ToolCategory::FileRead.default_timeout_ms(), 5_000);
        assert_eq!(ToolCategory::FileWrite.default_timeout_ms(), 10_000);
        assert_eq!(ToolCategory::ShellCommand.default_timeout_ms(), 30_000);
        assert_eq!(ToolCategory::PackageInstall.default_timeout_ms(), 180_000);
        assert_eq!(ToolCategory::Test.default_timeout_ms(), 300_000);
        assert_eq!(ToolCategory::Network.default_timeout_ms(), 30_000);
    }

    #[test]
    fn reversibility_defaults() {
        assert!(ToolCategory::FileWrite.reversible_by_default());
        assert!(!ToolCategory::FileDelete.reversible_by_default());
        assert!(!ToolCategory::ShellCommand.reversible_by_default());
        assert!(!ToolCategory::Network.reversible_by_default());
    }

    #[test]
    fn definition_overrides() {
        let def = ToolDefinition::new("rm_file", "Delete a file", ToolCategory::FileWrite)
            .irreversible()
            .with_timeout_ms(1_234);
        assert!(!def.is_reversible());
        assert_eq!(def.effective_timeout_ms(), 1_234);

        let def = ToolDefinition::new("read", "Read a file", ToolCategory::FileRead);
        assert!(def.is_reversible());
        assert_eq!(def.effective_timeout_ms(), 5_000);
    }

    #[test]
    fn category_name_roundtrip() {
        for cat in ToolCategory::ALL {
            assert_eq!(ToolCategory::from_name(cat.name()), Some(cat));
        }
        assert_eq!(ToolCategory::from_name("bogus"), None);
    }

    #[tokio::test]
    async fn fn_handler_wraps_closure() {
        let handler = FnHandler::sync(|input: serde_json::Value| {
            let n = input["n"].as_i64().unwrap_or(0);
            Ok(json!({ "doubled": n * 2 }))
        });
        let out = handler.execute(json!({"n": 21})).await.unwrap();
        assert_eq!(out["doubled"], 42);
    }
}
