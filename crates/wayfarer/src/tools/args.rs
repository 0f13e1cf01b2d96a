//! Typed tool arguments.
//!
//! Models emit loosely typed JSON: ids as `"12"` or `"[12]"`, a bare string
//! where a list is expected, booleans left out. Every call goes through
//! [`parse_action`], which normalizes the raw payload per tool, validates it
//! against the tool's JSON schema, and only then deserializes it into the
//! tagged [`BrowserAction`] union the driver consumes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::json_schema_for;

// ── Argument structs ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReadPageArgs {
    /// Maximum tree depth to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    /// Maximum number of nodes to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GetTextArgs {
    /// Restrict to the element with this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FindElementArgs {
    /// Natural-language description of the element.
    pub query: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SearchDirection {
    #[default]
    Next,
    Prev,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchTextArgs {
    pub query: String,
    #[serde(default)]
    pub direction: SearchDirection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClickArgs {
    /// Element id from the last page read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Viewport x coordinate, when clicking by position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default)]
    pub double: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TypeTextArgs {
    pub id: u32,
    pub text: String,
    /// Clear the field before typing.
    #[serde(default)]
    pub clear: bool,
    /// Press Enter afterwards.
    #[serde(default)]
    pub submit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScrollArgs {
    pub direction: ScrollDirection,
    /// Pixels to scroll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i32>,
    /// Scroll inside this element instead of the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HoverArgs {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SelectOptionArgs {
    pub id: u32,
    /// Option values or labels to select.
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PressKeyArgs {
    pub key: String,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DragArgs {
    pub from_id: u32,
    pub to_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FormField {
    pub id: u32,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SetFormArgs {
    pub fields: Vec<FormField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NavigateArgs {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GoBackArgs {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScreenshotArgs {
    #[serde(default)]
    pub full_page: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WaitForArgs {
    /// Wait until an element matching this description exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Wait until this text appears.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OpenTabArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SwitchTabArgs {
    pub tab_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CloseTabArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HttpRequestArgs {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvaluateJsArgs {
    pub script: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RememberArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SubmitPlanArgs {
    pub steps: Vec<String>,
}

/// Completion payload. Both fields may arrive empty and be repaired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DoneArgs {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FailArgs {
    pub reason: String,
}

// ── Action union ───────────────────────────────────────────────────

/// Every tool call the model can make, with typed arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum BrowserAction {
    ReadPage(ReadPageArgs),
    GetText(GetTextArgs),
    FindElement(FindElementArgs),
    SearchText(SearchTextArgs),
    Click(ClickArgs),
    TypeText(TypeTextArgs),
    Scroll(ScrollArgs),
    Hover(HoverArgs),
    SelectOption(SelectOptionArgs),
    PressKey(PressKeyArgs),
    Drag(DragArgs),
    SetForm(SetFormArgs),
    Navigate(NavigateArgs),
    GoBack(GoBackArgs),
    Screenshot(ScreenshotArgs),
    WaitFor(WaitForArgs),
    OpenTab(OpenTabArgs),
    SwitchTab(SwitchTabArgs),
    CloseTab(CloseTabArgs),
    HttpRequest(HttpRequestArgs),
    EvaluateJs(EvaluateJsArgs),
    Remember(RememberArgs),
    SubmitPlan(SubmitPlanArgs),
    Done(DoneArgs),
    Fail(FailArgs),
}

/// Broad class of an action, used for progress and evidence tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Structural or plain-text page read.
    Read,
    /// Free-text search on the page.
    Search,
    /// Element interaction that may change the page.
    Interact,
    /// Navigation or tab change.
    Navigate,
    /// Screenshot capture.
    Observe,
    /// Handled by the orchestrator without touching the driver.
    Internal,
    /// `done` or `fail`.
    Terminal,
    /// Out-of-page request (HTTP, script).
    External,
    /// Waiting for a condition.
    Wait,
}

impl BrowserAction {
    pub fn name(&self) -> &'static str {
        match self {
            BrowserAction::ReadPage(_) => "read_page",
            BrowserAction::GetText(_) => "get_text",
            BrowserAction::FindElement(_) => "find_element",
            BrowserAction::SearchText(_) => "search_text",
            BrowserAction::Click(_) => "click",
            BrowserAction::TypeText(_) => "type_text",
            BrowserAction::Scroll(_) => "scroll",
            BrowserAction::Hover(_) => "hover",
            BrowserAction::SelectOption(_) => "select_option",
            BrowserAction::PressKey(_) => "press_key",
            BrowserAction::Drag(_) => "drag",
            BrowserAction::SetForm(_) => "set_form",
            BrowserAction::Navigate(_) => "navigate",
            BrowserAction::GoBack(_) => "go_back",
            BrowserAction::Screenshot(_) => "screenshot",
            BrowserAction::WaitFor(_) => "wait_for",
            BrowserAction::OpenTab(_) => "open_tab",
            BrowserAction::SwitchTab(_) => "switch_tab",
            BrowserAction::CloseTab(_) => "close_tab",
            BrowserAction::HttpRequest(_) => "http_request",
            BrowserAction::EvaluateJs(_) => "evaluate_js",
            BrowserAction::Remember(_) => "remember",
            BrowserAction::SubmitPlan(_) => "submit_plan",
            BrowserAction::Done(_) => "done",
            BrowserAction::Fail(_) => "fail",
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            BrowserAction::ReadPage(_) | BrowserAction::GetText(_) | BrowserAction::FindElement(_) => {
                ActionKind::Read
            }
            BrowserAction::SearchText(_) => ActionKind::Search,
            BrowserAction::Click(_)
            | BrowserAction::TypeText(_)
            | BrowserAction::Scroll(_)
            | BrowserAction::Hover(_)
            | BrowserAction::SelectOption(_)
            | BrowserAction::PressKey(_)
            | BrowserAction::Drag(_)
            | BrowserAction::SetForm(_) => ActionKind::Interact,
            BrowserAction::Navigate(_)
            | BrowserAction::GoBack(_)
            | BrowserAction::OpenTab(_)
            | BrowserAction::SwitchTab(_)
            | BrowserAction::CloseTab(_) => ActionKind::Navigate,
            BrowserAction::Screenshot(_) => ActionKind::Observe,
            BrowserAction::WaitFor(_) => ActionKind::Wait,
            BrowserAction::HttpRequest(_) | BrowserAction::EvaluateJs(_) => ActionKind::External,
            BrowserAction::Remember(_) | BrowserAction::SubmitPlan(_) => ActionKind::Internal,
            BrowserAction::Done(_) | BrowserAction::Fail(_) => ActionKind::Terminal,
        }
    }

    /// Whether the orchestrator handles this action itself.
    pub fn is_internal(&self) -> bool {
        matches!(self.kind(), ActionKind::Internal | ActionKind::Terminal)
    }

    /// Query text of a page search.
    pub fn search_query(&self) -> Option<&str> {
        match self {
            BrowserAction::SearchText(args) => Some(&args.query),
            BrowserAction::FindElement(args) => Some(&args.query),
            _ => None,
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("arguments for `{tool}` are not valid JSON: {source}")]
    Json {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("arguments for `{tool}` must be a JSON object")]
    NotObject { tool: String },
    #[error("invalid arguments for `{tool}`:\n{errors}")]
    Schema { tool: String, errors: String },
    #[error("cannot decode arguments for `{tool}`: {source}")]
    Decode {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
}

// ── Normalization ──────────────────────────────────────────────────

/// Per-tool shape hints driving normalization.
#[derive(Debug, Clone, Copy)]
pub struct ArgShape {
    /// Element ids: bracket wrappers stripped, numeric strings coerced.
    pub ids: &'static [&'static str],
    /// Integer fields: numeric strings coerced.
    pub ints: &'static [&'static str],
    /// Float fields: numeric strings coerced.
    pub floats: &'static [&'static str],
    /// Boolean fields: defaulted to false, "true"/"false" coerced.
    pub bools: &'static [&'static str],
    /// List fields: a scalar is wrapped into a one-element array.
    pub lists: &'static [&'static str],
}

const NO_SHAPE: ArgShape = ArgShape {
    ids: &[],
    ints: &[],
    floats: &[],
    bools: &[],
    lists: &[],
};

/// Normalization hints and schema for a tool name.
pub fn arg_shape(tool: &str) -> Option<(ArgShape, Value)> {
    let entry = match tool {
        "read_page" => (
            ArgShape { ints: &["max_depth", "max_nodes"], ..NO_SHAPE },
            json_schema_for::<ReadPageArgs>(),
        ),
        "get_text" => (ArgShape { ids: &["id"], ..NO_SHAPE }, json_schema_for::<GetTextArgs>()),
        "find_element" => (NO_SHAPE, json_schema_for::<FindElementArgs>()),
        "search_text" => (NO_SHAPE, json_schema_for::<SearchTextArgs>()),
        "click" => (
            ArgShape { ids: &["id"], floats: &["x", "y"], bools: &["double"], ..NO_SHAPE },
            json_schema_for::<ClickArgs>(),
        ),
        "type_text" => (
            ArgShape { ids: &["id"], bools: &["clear", "submit"], ..NO_SHAPE },
            json_schema_for::<TypeTextArgs>(),
        ),
        "scroll" => (
            ArgShape { ids: &["id"], ints: &["amount"], ..NO_SHAPE },
            json_schema_for::<ScrollArgs>(),
        ),
        "hover" => (ArgShape { ids: &["id"], ..NO_SHAPE }, json_schema_for::<HoverArgs>()),
        "select_option" => (
            ArgShape { ids: &["id"], lists: &["values"], ..NO_SHAPE },
            json_schema_for::<SelectOptionArgs>(),
        ),
        "press_key" => (
            ArgShape { lists: &["modifiers"], ..NO_SHAPE },
            json_schema_for::<PressKeyArgs>(),
        ),
        "drag" => (
            ArgShape { ids: &["from_id", "to_id"], ..NO_SHAPE },
            json_schema_for::<DragArgs>(),
        ),
        "set_form" => (ArgShape { lists: &["fields"], ..NO_SHAPE }, json_schema_for::<SetFormArgs>()),
        "navigate" => (NO_SHAPE, json_schema_for::<NavigateArgs>()),
        "go_back" => (NO_SHAPE, json_schema_for::<GoBackArgs>()),
        "screenshot" => (
            ArgShape { bools: &["full_page"], ..NO_SHAPE },
            json_schema_for::<ScreenshotArgs>(),
        ),
        "wait_for" => (ArgShape { ints: &["timeout_ms"], ..NO_SHAPE }, json_schema_for::<WaitForArgs>()),
        "open_tab" => (NO_SHAPE, json_schema_for::<OpenTabArgs>()),
        "switch_tab" => (NO_SHAPE, json_schema_for::<SwitchTabArgs>()),
        "close_tab" => (NO_SHAPE, json_schema_for::<CloseTabArgs>()),
        "http_request" => (
            ArgShape { ints: &["timeout_ms"], ..NO_SHAPE },
            json_schema_for::<HttpRequestArgs>(),
        ),
        "evaluate_js" => (NO_SHAPE, json_schema_for::<EvaluateJsArgs>()),
        "remember" => (NO_SHAPE, json_schema_for::<RememberArgs>()),
        "submit_plan" => (ArgShape { lists: &["steps"], ..NO_SHAPE }, json_schema_for::<SubmitPlanArgs>()),
        "done" => (NO_SHAPE, json_schema_for::<DoneArgs>()),
        "fail" => (NO_SHAPE, json_schema_for::<FailArgs>()),
        _ => return None,
    };
    Some(entry)
}

/// Coerce a loosely typed payload in place according to `shape`.
pub fn normalize_arguments(shape: &ArgShape, args: &mut serde_json::Map<String, Value>) {
    for &key in shape.lists {
        if let Some(v) = args.get_mut(key)
            && !v.is_array()
            && !v.is_null()
        {
            *v = Value::Array(vec![v.take()]);
        }
    }
    for &key in shape.ids {
        if let Some(v) = args.get_mut(key) {
            coerce_id(v);
        }
    }
    // Nested form fields carry ids too.
    if let Some(Value::Array(fields)) = args.get_mut("fields") {
        for field in fields.iter_mut() {
            if let Some(id) = field.get_mut("id") {
                coerce_id(id);
            }
        }
    }
    for &key in shape.ints {
        if let Some(v) = args.get_mut(key)
            && let Some(n) = v.as_str().and_then(|s| s.trim().parse::<i64>().ok())
        {
            *v = Value::from(n);
        }
    }
    for &key in shape.floats {
        if let Some(v) = args.get_mut(key)
            && let Some(n) = v.as_str().and_then(|s| s.trim().parse::<f64>().ok())
        {
            *v = Value::from(n);
        }
    }
    for &key in shape.bools {
        let coerced = match args.get(key) {
            None | Some(Value::Null) => Some(false),
            Some(Value::String(s)) => Some(matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "1"
            )),
            Some(_) => None,
        };
        if let Some(b) = coerced {
            args.insert(key.to_string(), Value::Bool(b));
        }
    }
    // Optional fields sent as explicit null are treated as absent.
    args.retain(|_, v| !v.is_null());
}

/// `"[12]"`, `" 12 "`, and `12.0` all become `12`.
fn coerce_id(v: &mut Value) {
    let parsed = match v {
        Value::String(s) => s
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim()
            .parse::<u64>()
            .ok(),
        Value::Number(n) if n.as_u64().is_none() => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0)
            .map(|f| f as u64),
        Value::Array(items) if items.len() == 1 => {
            let mut inner = items[0].take();
            coerce_id(&mut inner);
            inner.as_u64()
        }
        _ => None,
    };
    if let Some(n) = parsed {
        *v = Value::from(n);
    }
}

/// Validate a payload against a tool schema. Returns one line per error.
///
/// A schema that does not compile rejects every payload.
pub fn validate_against_schema(schema: &Value, args: &Value) -> Result<(), String> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(e) => {
            warn!("tool schema does not compile, rejecting arguments: {e}");
            return Err(format!("  - tool schema does not compile: {e}"));
        }
    };
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("\n"))
    }
}

/// Normalize, validate, and decode one tool call.
pub fn parse_action(tool: &str, raw_arguments: &str) -> Result<BrowserAction, ArgsError> {
    let (shape, schema) = arg_shape(tool).ok_or_else(|| ArgsError::UnknownTool(tool.to_string()))?;

    let trimmed = raw_arguments.trim();
    let value: Value = if trimmed.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(trimmed).map_err(|source| ArgsError::Json {
            tool: tool.to_string(),
            source,
        })?
    };
    let Value::Object(mut args) = value else {
        return Err(ArgsError::NotObject {
            tool: tool.to_string(),
        });
    };

    normalize_arguments(&shape, &mut args);
    let args = Value::Object(args);
    validate_against_schema(&schema, &args).map_err(|errors| ArgsError::Schema {
        tool: tool.to_string(),
        errors,
    })?;

    serde_json::from_value(serde_json::json!({ "tool": tool, "args": args })).map_err(|source| {
        ArgsError::Decode {
            tool: tool.to_string(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_and_string_ids_are_coerced() {
        let action = parse_action("click", r#"{"id": "[12]"}"#).unwrap();
        assert_eq!(
            action,
            BrowserAction::Click(ClickArgs {
                id: Some(12),
                ..Default::default()
            })
        );
        let action = parse_action("hover", r#"{"id": " 7 "}"#).unwrap();
        assert_eq!(action, BrowserAction::Hover(HoverArgs { id: 7 }));
    }

    #[test]
    fn booleans_default_and_coerce() {
        let action = parse_action("type_text", r#"{"id": 3, "text": "hello", "submit": "true"}"#).unwrap();
        let BrowserAction::TypeText(args) = action else {
            panic!("expected type_text");
        };
        assert!(args.submit);
        assert!(!args.clear);
    }

    #[test]
    fn scalars_wrap_into_lists() {
        let action = parse_action("select_option", r#"{"id": "4", "values": "Large"}"#).unwrap();
        assert_eq!(
            action,
            BrowserAction::SelectOption(SelectOptionArgs {
                id: 4,
                values: vec!["Large".into()]
            })
        );
        let action = parse_action("submit_plan", r#"{"steps": "open site"}"#).unwrap();
        assert_eq!(
            action,
            BrowserAction::SubmitPlan(SubmitPlanArgs {
                steps: vec!["open site".into()]
            })
        );
    }

    #[test]
    fn numeric_strings_become_numbers() {
        let action = parse_action("scroll", r#"{"direction": "down", "amount": "600"}"#).unwrap();
        assert_eq!(
            action,
            BrowserAction::Scroll(ScrollArgs {
                direction: ScrollDirection::Down,
                amount: Some(600),
                id: None
            })
        );
        let action = parse_action("click", r#"{"x": "10.5", "y": "20"}"#).unwrap();
        let BrowserAction::Click(args) = action else {
            panic!("expected click");
        };
        assert_eq!(args.x, Some(10.5));
        assert_eq!(args.y, Some(20.0));
    }

    #[test]
    fn form_field_ids_are_coerced() {
        let action = parse_action(
            "set_form",
            r#"{"fields": [{"id": "[2]", "value": "a"}, {"id": 5, "value": "b"}]}"#,
        )
        .unwrap();
        let BrowserAction::SetForm(args) = action else {
            panic!("expected set_form");
        };
        assert_eq!(args.fields[0].id, 2);
        assert_eq!(args.fields[1].id, 5);
    }

    #[test]
    fn empty_arguments_are_an_empty_object() {
        assert_eq!(
            parse_action("go_back", "").unwrap(),
            BrowserAction::GoBack(GoBackArgs {})
        );
        assert_eq!(
            parse_action("done", "{}").unwrap(),
            BrowserAction::Done(DoneArgs::default())
        );
    }

    #[test]
    fn missing_required_field_fails_schema() {
        let err = parse_action("navigate", "{}").unwrap_err();
        assert!(matches!(err, ArgsError::Schema { .. }), "{err}");
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn unknown_tool_and_bad_json() {
        assert!(matches!(
            parse_action("teleport", "{}"),
            Err(ArgsError::UnknownTool(_))
        ));
        assert!(matches!(
            parse_action("click", "{not json"),
            Err(ArgsError::Json { .. })
        ));
        assert!(matches!(
            parse_action("click", "[1, 2]"),
            Err(ArgsError::NotObject { .. })
        ));
    }

    #[test]
    fn explicit_nulls_are_dropped() {
        let action = parse_action("read_page", r#"{"max_depth": null, "max_nodes": "200"}"#).unwrap();
        assert_eq!(
            action,
            BrowserAction::ReadPage(ReadPageArgs {
                max_depth: None,
                max_nodes: Some(200)
            })
        );
    }

    #[test]
    fn actions_serialize_tagged() {
        let json = serde_json::to_value(BrowserAction::Navigate(NavigateArgs {
            url: "https://example.com".into(),
        }))
        .unwrap();
        assert_eq!(json["tool"], "navigate");
        assert_eq!(json["args"]["url"], "https://example.com");
    }

    #[test]
    fn kinds() {
        assert_eq!(parse_action("search_text", r#"{"query":"x"}"#).unwrap().kind(), ActionKind::Search);
        assert!(parse_action("remember", r#"{"key":"a","value":"b"}"#).unwrap().is_internal());
        assert_eq!(parse_action("go_back", "{}").unwrap().name(), "go_back");
        let find = parse_action("find_element", r#"{"query":"buy button"}"#).unwrap();
        assert_eq!(find.search_query(), Some("buy button"));
        assert_eq!(parse_action("go_back", "{}").unwrap().search_query(), None);
    }

    #[test]
    fn uncompilable_schema_rejects_payload() {
        let broken = serde_json::json!({"type": 12});
        let err = validate_against_schema(&broken, &serde_json::json!({})).unwrap_err();
        assert!(err.contains("does not compile"));
    }

    #[test]
    fn every_tool_schema_compiles() {
        for def in crate::tools::ToolCatalog::new().definitions() {
            let (_, schema) = arg_shape(def.name()).unwrap();
            assert!(jsonschema::validator_for(&schema).is_ok(), "{}", def.name());
        }
    }
}
