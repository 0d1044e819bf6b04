//! Declarative decomposition rules.
//!
//! Decomposition is driven by data: capability rules say which words and
//! prefixes select a capability, and composite rules map a request pattern
//! to a template graph of steps.

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::{capabilities, Capability, CompositionRule};
use crate::error::{Error, Result};

/// How a single clause selects a capability.
#[derive(Debug, Clone)]
pub struct CapabilityRule {
    pub capability: Capability,
    /// Names accepted in the `<alias>: <text>` prefix form.
    pub aliases: Vec<String>,
    /// Lowercase fragments that select this capability when found anywhere
    /// in the clause.
    pub keywords: Vec<String>,
}

impl CapabilityRule {
    pub fn new(capability: &str, aliases: &[&str], keywords: &[&str]) -> Self {
        let capability = Capability::new(capability);
        let mut all_aliases = vec![capability.as_str().to_string()];
        for alias in aliases {
            let alias = alias.trim().to_lowercase();
            if !all_aliases.contains(&alias) {
                all_aliases.push(alias);
            }
        }
        Self {
            capability,
            aliases: all_aliases,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    fn matches_alias(&self, name: &str) -> bool {
        self.aliases.iter().any(|a| a == name)
    }

    fn matches_text(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

/// One step of a composite template.
#[derive(Debug, Clone)]
pub struct StepTemplate {
    pub step: String,
    pub capability: Capability,
    /// Steps of the same template this one waits for.
    pub depends_on: Vec<String>,
    /// Extra payload fields merged under the request text.
    pub payload: Map<String, Value>,
}

impl StepTemplate {
    pub fn new(step: &str, capability: &str) -> Self {
        Self {
            step: step.to_string(),
            capability: Capability::new(capability),
            depends_on: Vec::new(),
            payload: Map::new(),
        }
    }

    pub fn after(mut self, step: &str) -> Self {
        self.depends_on.push(step.to_string());
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }
}

/// A request pattern expanded into a fixed graph of steps.
#[derive(Debug, Clone)]
pub struct CompositeRule {
    pub name: String,
    pub pattern: Regex,
    pub steps: Vec<StepTemplate>,
    pub composition: Option<CompositionRule>,
}

impl CompositeRule {
    /// # Errors
    /// Fails on an invalid pattern, an empty or duplicate step list, or a
    /// dependency on a step that is not declared earlier in the template.
    pub fn new(name: &str, pattern: &str, steps: Vec<StepTemplate>) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Validation(format!("rule '{}': {}", name, e)))?;
        if steps.is_empty() {
            return Err(Error::Validation(format!("rule '{}' has no steps", name)));
        }
        for (i, step) in steps.iter().enumerate() {
            let earlier = &steps[..i];
            if earlier.iter().any(|s| s.step == step.step) {
                return Err(Error::Validation(format!(
                    "rule '{}' declares step '{}' twice",
                    name, step.step
                )));
            }
            if let Some(dep) = step
                .depends_on
                .iter()
                .find(|d| !earlier.iter().any(|s| &s.step == *d))
            {
                return Err(Error::Validation(format!(
                    "rule '{}': step '{}' depends on '{}' which is not declared before it",
                    name, step.step, dep
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            pattern,
            steps,
            composition: None,
        })
    }

    pub fn with_composition(mut self, composition: CompositionRule) -> Self {
        self.composition = Some(composition);
        self
    }
}

/// The full decomposition table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    /// In classification priority order.
    pub capabilities: Vec<CapabilityRule>,
    /// Tried in order; the first match wins.
    pub composites: Vec<CompositeRule>,
    /// Splits a request into sequential clauses.
    pub connectors: Regex,
    /// Matches the `<name>: <text>` prefix form.
    prefix: Regex,
}

impl RuleTable {
    /// A table with no rules; only explicit plans and the fallback apply.
    pub fn empty() -> Result<Self> {
        Ok(Self {
            capabilities: Vec::new(),
            composites: Vec::new(),
            connectors: compile(r"(?i)\s*,?\s*\b(?:and then|then|after that|afterwards)\b\s*")?,
            prefix: compile(r"(?s)^\s*([A-Za-z][\w-]*)\s*:\s*(.*)$")?,
        })
    }

    /// The standard rules for the built-in capabilities.
    pub fn builtin() -> Result<Self> {
        let mut table = Self::empty()?;
        table.capabilities = vec![
            CapabilityRule::new(
                capabilities::SEARCH,
                &["web", "web_search", "google"],
                &["search"],
            ),
            CapabilityRule::new(
                capabilities::RETRIEVAL,
                &["retrieve", "data", "fetch", "data_retrieval"],
                &["data", "fetch", "retriev"],
            ),
            CapabilityRule::new(capabilities::REPORT, &["report_generation"], &["report"]),
            CapabilityRule::new(
                capabilities::ANALYSIS,
                &["analyze", "analyse", "dashboard", "analysis_dashboard"],
                &["dashboard", "analy"],
            ),
            CapabilityRule::new(capabilities::LLM, &["ask", "chat", "llm_response"], &[]),
        ];
        table.composites = vec![
            CompositeRule::new(
                "report_from_data",
                r"(?i)\breport\b.*\b(?:from|on|using|of)\b.*\b(?:data|retriev\w*|records|database)\b",
                vec![
                    StepTemplate::new("retrieval", capabilities::RETRIEVAL),
                    StepTemplate::new("report", capabilities::REPORT).after("retrieval"),
                ],
            )?,
            CompositeRule::new(
                "dashboard_from_data",
                r"(?i)\b(?:dashboard|analy[sz]\w*)\b.*\b(?:from|of|on|using)\b.*\b(?:data|retriev\w*|records|database)\b",
                vec![
                    StepTemplate::new("retrieval", capabilities::RETRIEVAL),
                    StepTemplate::new("analysis", capabilities::ANALYSIS).after("retrieval"),
                ],
            )?,
            CompositeRule::new(
                "briefing",
                r"(?i)^\s*(?:brief|briefing)\b",
                vec![
                    StepTemplate::new("search", capabilities::SEARCH),
                    StepTemplate::new("retrieval", capabilities::RETRIEVAL),
                    StepTemplate::new("report", capabilities::REPORT)
                        .after("search")
                        .after("retrieval"),
                ],
            )?,
        ];
        Ok(table)
    }

    pub fn with_capability(mut self, rule: CapabilityRule) -> Self {
        self.capabilities.push(rule);
        self
    }

    pub fn with_composite(mut self, rule: CompositeRule) -> Self {
        self.composites.push(rule);
        self
    }

    /// Resolve a capability name or alias.
    pub fn resolve_alias(&self, name: &str) -> Option<&Capability> {
        let name = name.trim().to_lowercase();
        self.capabilities
            .iter()
            .find(|r| r.matches_alias(&name))
            .map(|r| &r.capability)
    }

    /// Split off an explicit `<alias>: <text>` prefix.
    pub fn split_prefix<'a>(&self, clause: &'a str) -> Option<(&Capability, &'a str)> {
        let caps = self.prefix.captures(clause)?;
        let name = caps.get(1)?.as_str();
        let rest = caps.get(2)?.as_str().trim();
        self.resolve_alias(name).map(|cap| (cap, rest))
    }

    /// Keyword classification in priority order.
    pub fn classify(&self, clause: &str) -> Option<&Capability> {
        let lowered = clause.to_lowercase();
        self.capabilities
            .iter()
            .find(|r| r.matches_text(&lowered))
            .map(|r| &r.capability)
    }

    /// First composite rule matching the whole request.
    pub fn composite_for(&self, text: &str) -> Option<&CompositeRule> {
        self.composites.iter().find(|r| r.pattern.is_match(text))
    }

    /// Split on sequencing connectors, dropping empty clauses.
    pub fn clauses<'a>(&self, text: &'a str) -> Vec<&'a str> {
        self.connectors
            .split(text)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// Every capability the table can produce, sorted and deduplicated.
    pub fn referenced_capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self
            .capabilities
            .iter()
            .map(|r| r.capability.clone())
            .chain(
                self.composites
                    .iter()
                    .flat_map(|r| r.steps.iter().map(|s| s.capability.clone())),
            )
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Validation(format!("invalid pattern: {}", e)))
}
