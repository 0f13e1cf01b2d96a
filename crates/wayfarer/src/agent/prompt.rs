//! System prompt assembly and per-model prompt variants.
//!
//! Some providers and models need extra instructions (models that narrate
//! instead of calling tools, models that invent element ids). Instead of a
//! chain of predicates those addenda live in [`PromptVariants`], a table of
//! `(provider pattern, model pattern) → addendum` rows where the first
//! matching row wins.

use regex::Regex;

use crate::api::provider::ProviderCapabilities;

// ── Builder ────────────────────────────────────────────────────────

/// Multi-section system prompt. Empty sections are skipped.
///
/// ```
/// use wayfarer::agent::prompt::SystemPromptBuilder;
///
/// let prompt = SystemPromptBuilder::new("You drive a browser.")
///     .section("Plan", "Submit a plan first.")
///     .section_if(false, "Scripts", || "Never shown.".into())
///     .section_opt("Model notes", None::<String>)
///     .build();
/// assert!(prompt.contains("## Plan"));
/// assert!(!prompt.contains("Scripts"));
/// ```
pub struct SystemPromptBuilder {
    sections: Vec<String>,
}

impl SystemPromptBuilder {
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            sections: vec![preamble.into()],
        }
    }

    pub fn section(mut self, heading: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.trim().is_empty() {
            self.sections.push(format!("## {heading}\n\n{content}"));
        }
        self
    }

    pub fn section_if(self, condition: bool, heading: &str, content: impl FnOnce() -> String) -> Self {
        if condition {
            self.section(heading, content())
        } else {
            self
        }
    }

    pub fn section_opt(self, heading: &str, content: Option<impl Into<String>>) -> Self {
        match content {
            Some(c) => self.section(heading, c),
            None => self,
        }
    }

    pub fn build(self) -> String {
        self.sections.join("\n\n")
    }
}

// ── Variants ───────────────────────────────────────────────────────

/// One row of the variant table.
#[derive(Debug, Clone)]
pub struct PromptVariant {
    pub name: String,
    provider: Regex,
    model: Regex,
    pub addendum: String,
}

impl PromptVariant {
    /// Patterns are case-insensitive regexes matched anywhere in the string.
    pub fn new(
        name: impl Into<String>,
        provider_pattern: &str,
        model_pattern: &str,
        addendum: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            provider: Regex::new(&format!("(?i){provider_pattern}"))?,
            model: Regex::new(&format!("(?i){model_pattern}"))?,
            addendum: addendum.into(),
        })
    }

    pub fn matches(&self, provider: &str, model: &str) -> bool {
        self.provider.is_match(provider) && self.model.is_match(model)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptVariants {
    rows: Vec<PromptVariant>,
}

const BUILTIN: &[(&str, &str, &str, &str)] = &[
    (
        "reasoning-narrators",
        ".*",
        r"(deepseek-r1|o1|o3|qwq)",
        "Do not describe what you would do. Every reply must be a tool call; put your \
         reasoning in the tool arguments only when a tool asks for it.",
    ),
    (
        "small-models",
        ".*",
        r"(mini|flash|haiku|8b|7b)",
        "Only use element ids that appear in the most recent read_page output. If you are \
         unsure an id is current, call read_page first.",
    ),
    (
        "openrouter-default",
        "openrouter",
        ".*",
        "Call one tool at a time unless the calls are independent of each other.",
    ),
];

impl PromptVariants {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock table.
    pub fn builtin() -> Self {
        let rows = BUILTIN
            .iter()
            .filter_map(|(name, provider, model, addendum)| {
                PromptVariant::new(*name, provider, model, *addendum).ok()
            })
            .collect();
        Self { rows }
    }

    /// Add a row. Rows are matched in insertion order.
    pub fn with(mut self, variant: PromptVariant) -> Self {
        self.rows.push(variant);
        self
    }

    /// Put a row ahead of every existing one.
    pub fn with_override(mut self, variant: PromptVariant) -> Self {
        self.rows.insert(0, variant);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First matching row for a provider/model pair.
    pub fn select(&self, provider: &str, model: &str) -> Option<&PromptVariant> {
        self.rows.iter().find(|row| row.matches(provider, model))
    }

    pub fn addendum_for(&self, capabilities: &ProviderCapabilities) -> Option<&str> {
        self.select(&capabilities.provider, &capabilities.model)
            .map(|v| v.addendum.as_str())
    }
}

const PLAN_SECTION: &str = "Before any other action, call submit_plan with the ordered steps \
you intend to take. Wait for approval. If the plan is denied, revise it using the feedback.";

const SCRIPTS_SECTION: &str = "evaluate_js runs only on domains the user has allowed. The first \
call on a new domain pauses until the user decides.";

/// Full system prompt for a run.
pub fn build_system_prompt(
    base: &str,
    capabilities: &ProviderCapabilities,
    variants: &PromptVariants,
    require_plan: bool,
    allow_scripts: bool,
) -> String {
    SystemPromptBuilder::new(base)
        .section_if(require_plan, "Plan approval", || PLAN_SECTION.to_string())
        .section_if(allow_scripts, "Scripts", || SCRIPTS_SECTION.to_string())
        .section_opt("Model notes", variants.addendum_for(capabilities))
        .build()
}
