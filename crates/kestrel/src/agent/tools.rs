//! Tool registry interface and a closure-backed implementation.
//!
//! The runner only needs [`ToolRegistry`]: a list of definitions to offer
//! the model and a way to execute one call. [`ToolSet`] implements it over
//! named [`Tool`]s with optional JSON Schema validation, a timeout and result
//! truncation; [`FnTool`] turns an async closure into a tool.

use crate::ToolCall;
use crate::ToolDefinition;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default timeout for tool execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one tool execution, fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// What the runner executes tool calls against.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn list(&self) -> Vec<ToolDefinition>;

    /// Execute one call. Failures are reported as `is_error` output, never
    /// as a Rust error: the model sees them and can correct itself.
    async fn execute(&self, cancel: &CancellationToken, call: &ToolCall) -> ToolOutput;
}

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolOutput> + Send + 'a>>;

pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn execute(&self, arguments: &Value) -> ToolFuture<'_>;

    fn name(&self) -> String {
        self.definition().name
    }
}

/// JSON Schema for an argument type, for [`ToolDefinition::parameters`].
pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── ToolSet ────────────────────────────────────────────────────────

pub struct ToolSet {
    tools: BTreeMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
    validate_args: bool,
    timeout: Option<Duration>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("max_result_bytes", &self.max_result_bytes)
            .finish()
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: true,
            timeout: Some(DEFAULT_TOOL_TIMEOUT),
        }
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Per-call timeout. `None` disables it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a tool, replacing any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolRegistry for ToolSet {
    fn list(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    async fn execute(&self, cancel: &CancellationToken, call: &ToolCall) -> ToolOutput {
        let name = call.name.as_str();
        let Some(tool) = self.tools.get(name) else {
            return ToolOutput::error(format!("Error: unknown tool '{name}'"));
        };
        if self.validate_args
            && let Some(error) = validate_tool_arguments(tool.as_ref(), &call.input)
        {
            return ToolOutput::error(error);
        }

        log_tool_call(name, &call.input);
        let start = Instant::now();
        let run = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, tool.execute(&call.input)).await {
                    Ok(out) => out,
                    Err(_) => {
                        info!("tool timed out: name={name}, secs={:.0}", limit.as_secs_f64());
                        ToolOutput::error(format!(
                            "Error: tool '{name}' timed out after {:.0} seconds. \
                             Try smaller steps or different arguments.",
                            limit.as_secs_f64()
                        ))
                    }
                },
                None => tool.execute(&call.input).await,
            }
        };
        let out = tokio::select! {
            _ = cancel.cancelled() => ToolOutput::error(format!("Error: tool '{name}' was cancelled")),
            out = run => out,
        };

        debug!(
            "tool completed: name={name}, ms={:.0}, bytes={}, error={}",
            start.elapsed().as_secs_f64() * 1000.0,
            out.content.len(),
            out.is_error
        );
        ToolOutput {
            content: truncate_result(out.content, self.max_result_bytes),
            is_error: out.is_error,
        }
    }
}

// ── FnTool ─────────────────────────────────────────────────────────

type ErasedToolHandler = Box<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ToolOutput> + Send>> + Send + Sync>;

/// A closure-based tool that deserializes its arguments and delegates to an
/// async handler. `Err` from the handler becomes an `is_error` result.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct WeatherArgs {
///     /// City name.
///     city: String,
/// }
///
/// let tool = FnTool::new(
///     ToolDefinition::new("weather", "Current weather for a city", json_schema_for::<WeatherArgs>()),
///     |args: WeatherArgs| async move { Ok::<_, String>(format!("Sunny in {}", args.city)) },
/// );
/// ```
pub struct FnTool {
    def: ToolDefinition,
    handler: ErasedToolHandler,
}

impl FnTool {
    pub fn new<A, F, Fut, E>(def: ToolDefinition, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<String, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let erased = move |raw: Value| -> Pin<Box<dyn Future<Output = ToolOutput> + Send>> {
            let args: A = match serde_json::from_value(raw) {
                Ok(a) => a,
                Err(e) => {
                    return Box::pin(async move {
                        ToolOutput::error(format!(
                            "Error: invalid tool arguments: {e}. \
                             Please provide valid JSON matching the tool's parameter schema."
                        ))
                    });
                }
            };
            let fut = handler(args);
            Box::pin(async move {
                match fut.await {
                    Ok(content) => ToolOutput::ok(content),
                    Err(e) => ToolOutput::error(format!("Error: {e}")),
                }
            })
        };
        Self {
            def,
            handler: Box::new(erased),
        }
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDefinition {
        self.def.clone()
    }

    fn execute(&self, arguments: &Value) -> ToolFuture<'_> {
        (self.handler)(arguments.clone())
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool").field("name", &self.def.name).finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate arguments against the tool's declared JSON Schema. Returns an
/// error message for the model, or `None` if valid (or the schema itself is
/// unusable).
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &Value) -> Option<String> {
    let schema = tool.definition().parameters;
    let validator = jsonschema::validator_for(&schema).ok()?;
    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Error: argument validation failed for tool '{}':\n{}\n\
             Please fix the arguments and try again.",
            tool.name(),
            errors.join("\n")
        ))
    }
}

fn log_tool_call(name: &str, arguments: &Value) {
    let raw = arguments.to_string();
    let preview: String = raw.chars().take(120).collect();
    info!(
        "[tool] {name}({preview}{})",
        if raw.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {raw}");
}

/// Truncate to at most `max` bytes on a char boundary, noting the original size.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let cut = (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0);
    let head = s.get(..cut).unwrap_or_default();
    format!("{head}...\n[truncated: {} bytes total]", s.len())
}
