//! Tool definitions offered to the model.
//!
//! Parameter schemas come from the argument structs in [`args`](super::args)
//! so the definitions and the decode path can never drift apart.

use crate::ToolDef;

use super::args::arg_shape;

/// Tools offered when the model stalls without calling one and no page is
/// loaded yet.
pub const RECOVERY_NO_PAGE: &[&str] = &["navigate", "fail"];

/// Tools offered when the model stalls on a loaded page.
pub const RECOVERY_ON_PAGE: &[&str] = &["read_page", "find_element", "click", "done", "fail"];

const DESCRIPTIONS: &[(&str, &str)] = &[
    (
        "read_page",
        "Read the structure of the current page as an accessibility tree with element ids. \
         Call this before interacting and again after the page changes.",
    ),
    ("get_text", "Return the visible text of the page, or of one element by id."),
    (
        "find_element",
        "Locate elements matching a natural-language description. Returns candidate ids.",
    ),
    (
        "search_text",
        "Find occurrences of a phrase on the page. Use direction to move to the next or \
         previous match. Follow up with read_page before relying on a match.",
    ),
    (
        "click",
        "Click an element by id from the last page read, or at viewport coordinates x/y.",
    ),
    ("type_text", "Type text into an input by id. Set clear to replace, submit to press Enter."),
    ("scroll", "Scroll the page, or a scrollable element by id, in a direction."),
    ("hover", "Move the pointer over an element by id."),
    ("select_option", "Select one or more options of a <select> element by value or label."),
    ("press_key", "Press a key such as Enter, Escape, or ArrowDown, with optional modifiers."),
    ("drag", "Drag one element onto another."),
    ("set_form", "Fill several form fields at once. Each field is an element id and a value."),
    ("navigate", "Open a URL in the current tab."),
    ("go_back", "Go back one entry in the tab history."),
    ("screenshot", "Capture a screenshot of the viewport, or of the full page."),
    (
        "wait_for",
        "Wait until an element or text appears, up to timeout_ms (clamped to 30 seconds).",
    ),
    ("open_tab", "Open a new tab, optionally at a URL."),
    ("switch_tab", "Make another tab the active one."),
    ("close_tab", "Close a tab, the active one by default."),
    (
        "http_request",
        "Send an HTTP request outside the page. Responses are size-limited; private \
         network addresses are refused.",
    ),
    (
        "evaluate_js",
        "Run a JavaScript snippet in the page and return its result. Requires the user to \
         allow scripts on the current domain.",
    ),
    (
        "remember",
        "Store a fact under a key in scratch memory. It stays visible in the task state for \
         the rest of the run.",
    ),
    ("submit_plan", "Submit an ordered list of steps for the user to approve before acting."),
    (
        "done",
        "Finish the task. summary describes what was done; answer holds the final result. \
         Both are required and the answer must be backed by a page read.",
    ),
    ("fail", "Give up on the task with a reason."),
];

fn definition(name: &str, description: &str) -> Option<ToolDef> {
    let (_, schema) = arg_shape(name)?;
    Some(ToolDef::new(name, description, schema))
}

/// The full tool list plus the restricted subsets used for recovery.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDef>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCatalog {
    /// Every browser tool, in a stable order.
    pub fn new() -> Self {
        let tools = DESCRIPTIONS
            .iter()
            .filter_map(|(name, description)| definition(name, description))
            .collect();
        Self { tools }
    }

    /// Drop tools by name (e.g. `evaluate_js` when scripts are disabled).
    pub fn without(mut self, names: &[&str]) -> Self {
        self.tools.retain(|t| !names.contains(&t.name()));
        self
    }

    /// Drop `submit_plan` unless plan approval is enabled.
    pub fn with_plan_tool(self, enabled: bool) -> Self {
        if enabled { self } else { self.without(&["submit_plan"]) }
    }

    pub fn definitions(&self) -> &[ToolDef] {
        &self.tools
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(ToolDef::name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions restricted to `names`, preserving catalog order.
    pub fn restricted(&self, names: &[&str]) -> Vec<ToolDef> {
        self.tools
            .iter()
            .filter(|t| names.contains(&t.name()))
            .cloned()
            .collect()
    }

    /// The recovery subset for the current page state.
    pub fn recovery(&self, has_page: bool) -> Vec<ToolDef> {
        self.restricted(if has_page {
            RECOVERY_ON_PAGE
        } else {
            RECOVERY_NO_PAGE
        })
    }
}
