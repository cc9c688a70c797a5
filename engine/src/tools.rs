//! Tool capability, registry and confirmation interfaces.
//!
//! Concrete tools live outside this crate. The scheduler only needs to look a
//! tool up by name, ask whether a call needs human confirmation, and execute it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parley_types::{FunctionDeclaration, Part, Tool as ToolGroup, ToolCallRequest};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Tool future type alias.
pub type ToolFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ToolError>> + Send + 'a>>;

/// Confirmation future type alias.
pub type ConfirmFut<'a> = Pin<Box<dyn Future<Output = ConfirmationOutcome> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("{message}")]
    ExecutionFailed { message: String },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }
}

/// Deserialize tool arguments into a typed struct.
pub fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::BadArgs {
        message: e.to_string(),
    })
}

// ============================================================================
// Tool results
// ============================================================================

/// Raw output a tool hands back for the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text(String),
    Part(Part),
    Parts(Vec<Part>),
}

impl From<String> for ToolContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ToolContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Part> for ToolContent {
    fn from(value: Part) -> Self {
        Self::Part(value)
    }
}

impl From<Vec<Part>> for ToolContent {
    fn from(value: Vec<Part>) -> Self {
        Self::Parts(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// Content fed back to the model.
    pub llm_content: ToolContent,
    /// Short user-facing rendering, when it differs from the model content.
    pub display: Option<String>,
}

impl ToolResult {
    pub fn new(llm_content: impl Into<ToolContent>) -> Self {
        Self {
            llm_content: llm_content.into(),
            display: None,
        }
    }

    #[must_use]
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }
}

// ============================================================================
// Confirmation
// ============================================================================

/// User decision on a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmationOutcome {
    ProceedOnce,
    ProceedAlways,
    ProceedAlwaysServer,
    ProceedAlwaysTool,
    Cancel,
}

impl ConfirmationOutcome {
    #[must_use]
    pub const fn is_approved(self) -> bool {
        !matches!(self, Self::Cancel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationKind {
    /// Runs a command.
    Exec,
    /// Modifies a file.
    Edit,
    /// Reaches outside the local machine.
    Info,
}

/// Continuation invoked with the user's decision before the call proceeds.
pub type OnConfirm = Arc<dyn Fn(ConfirmationOutcome) + Send + Sync>;

/// What a tool wants the user to approve.
#[derive(Clone)]
pub struct ConfirmationDetails {
    pub kind: ConfirmationKind,
    pub title: String,
    /// Human-readable description of the action.
    pub description: String,
    pub on_confirm: Option<OnConfirm>,
}

impl ConfirmationDetails {
    pub fn new(kind: ConfirmationKind, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            description: description.into(),
            on_confirm: None,
        }
    }

    #[must_use]
    pub fn with_on_confirm(mut self, on_confirm: impl Fn(ConfirmationOutcome) + Send + Sync + 'static) -> Self {
        self.on_confirm = Some(Arc::new(on_confirm));
        self
    }
}

impl fmt::Debug for ConfirmationDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmationDetails")
            .field("kind", &self.kind)
            .field("title", &self.title)
            .field("description", &self.description)
            .field("on_confirm", &self.on_confirm.is_some())
            .finish()
    }
}

/// The confirmation UI: asks a human and reports the outcome.
pub trait ConfirmationHandler: Send + Sync {
    fn confirm<'a>(
        &'a self,
        request: &'a ToolCallRequest,
        details: &'a ConfirmationDetails,
    ) -> ConfirmFut<'a>;
}

/// Approves every prompt without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ConfirmationHandler for AutoApprove {
    fn confirm<'a>(
        &'a self,
        _request: &'a ToolCallRequest,
        _details: &'a ConfirmationDetails,
    ) -> ConfirmFut<'a> {
        Box::pin(async { ConfirmationOutcome::ProceedOnce })
    }
}

// ============================================================================
// Tool capability
// ============================================================================

pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the arguments.
    fn schema(&self) -> Value;

    /// Returns what the user must approve before `execute`, or `None`.
    fn should_confirm_execute<'a>(
        &'a self,
        _args: &'a Value,
        _cancel: &'a CancellationToken,
    ) -> ToolFut<'a, Option<ConfirmationDetails>> {
        Box::pin(async { Ok(None) })
    }

    /// Runs the tool. Long-running tools must observe `cancel`.
    fn execute<'a>(&'a self, args: &'a Value, cancel: CancellationToken) -> ToolFut<'a, ToolResult>;

    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration::new(self.name(), self.description(), self.schema())
    }
}

/// Registered tools, looked up by name at schedule time.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    #[must_use]
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations sorted by name.
    #[must_use]
    pub fn function_declarations(&self) -> Vec<FunctionDeclaration> {
        let mut decls: Vec<FunctionDeclaration> =
            self.tools.values().map(|tool| tool.declaration()).collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// Declarations wrapped as a single tool group, or nothing when empty.
    #[must_use]
    pub fn tool_groups(&self) -> Vec<ToolGroup> {
        if self.tools.is_empty() {
            return Vec::new();
        }
        vec![ToolGroup {
            function_declarations: self.function_declarations(),
        }]
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}
