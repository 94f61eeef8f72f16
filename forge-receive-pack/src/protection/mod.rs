//! Protection rules: evaluation of a repository's stored rules against a classified push.
//!
//! Rules are stored as `(kind, pattern, definition)` with JSON pattern and definition. The
//! [`RuleParsers`] map, built at startup, turns a definition into a typed [`Definition`] by kind.
//! Parsing failures are fatal for the push, a protection rule is never skipped silently.
//!
//! For each rule, in stored order, the engine:
//!
//! 1. skips it if it is disabled,
//! 2. narrows the ref names to those its pattern matches,
//! 3. lets the definition report violations for them,
//! 4. decides whether the violations block, are bypassed, or are only monitored.

use std::collections::HashMap;
use std::sync::Arc;

use crate::classify::Action;
use crate::refs::RefType;
use crate::store::{Principal, ProtectionRule, Repository, RuleState, RuleStore};
use crate::Error;

pub mod branch;
pub mod pattern;

pub use pattern::Pattern;

/// The push action a rule is asked about.
#[derive(Debug, Clone, Copy)]
pub struct VerifyInput<'a> {
    pub actor: &'a Principal,
    pub is_repo_owner: bool,
    /// Whether the caller lets bypassable violations pass.
    pub allow_bypass: bool,
    pub repo: &'a Repository,
    pub action: Action,
    pub ref_type: RefType,
    /// Short ref names, sorted.
    pub ref_names: &'a [String],
}

/// One objection of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Stable identifier like `lifecycle.delete`.
    pub code: &'static str,
    pub message: String,
}

/// What a definition reports for a set of refs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub violations: Vec<Violation>,
    /// The actor is allowed to bypass this rule.
    pub can_bypass: bool,
}

/// The violations of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolations {
    pub rule_id: i64,
    pub identifier: String,
    /// The violations block the push.
    pub critical: bool,
    /// The violations would block, but the actor bypassed them.
    pub bypassed: bool,
    pub violations: Vec<Violation>,
}

impl RuleViolations {
    /// Terminal lines, prefixed according to whether the rule was bypassed.
    pub fn messages(&self) -> impl Iterator<Item = String> + '_ {
        self.violations.iter().map(move |v| {
            if self.bypassed {
                format!("Bypassed rule \"{}\": {}", self.identifier, v.message)
            } else {
                format!("Rule \"{}\" violation: {}", self.identifier, v.message)
            }
        })
    }
}

/// True if any rule blocks the push.
pub fn is_critical(violations: &[RuleViolations]) -> bool {
    violations.iter().any(|v| v.critical)
}

/// A parsed rule definition, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definition {
    Branch(branch::Branch),
}

impl Definition {
    fn verify(&self, input: &VerifyInput<'_>, names: &[&str]) -> Verdict {
        match self {
            Definition::Branch(branch) => branch.verify(input, names),
        }
    }
}

type ParseFn = fn(&serde_json::Value) -> Result<Definition, String>;

/// Definition parsers by rule kind.
#[derive(Debug, Clone)]
pub struct RuleParsers {
    by_kind: HashMap<&'static str, ParseFn>,
}

impl RuleParsers {
    /// A map without any kinds; every rule fails to parse.
    pub fn empty() -> Self {
        RuleParsers { by_kind: HashMap::new() }
    }

    /// All kinds this crate knows.
    pub fn builtin() -> Self {
        Self::empty().with("branch", |def| {
            serde_json::from_value(def.clone())
                .map(Definition::Branch)
                .map_err(|e| e.to_string())
        })
    }

    pub fn with(mut self, kind: &'static str, parse: ParseFn) -> Self {
        self.by_kind.insert(kind, parse);
        self
    }

    /// Parse the pattern and definition of `rule`.
    pub fn parse(&self, rule: &ProtectionRule) -> Result<(Pattern, Definition), Error> {
        let invalid = |message: String| Error::RuleDefinition {
            rule: rule.identifier.clone(),
            message,
        };
        let parse = self
            .by_kind
            .get(rule.kind.as_str())
            .ok_or_else(|| invalid(format!("unknown rule kind {:?}", rule.kind)))?;
        let pattern: Pattern = if rule.pattern.is_null() {
            Pattern::default()
        } else {
            serde_json::from_value(rule.pattern.clone()).map_err(|e| invalid(format!("pattern: {e}")))?
        };
        pattern.validate().map_err(invalid)?;
        let definition = parse(&rule.definition).map_err(|e| invalid(format!("definition: {e}")))?;
        Ok((pattern, definition))
    }
}

impl Default for RuleParsers {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Evaluates a repository's protection rules.
#[derive(Clone)]
pub struct ProtectionEngine {
    rules: Arc<dyn RuleStore>,
    parsers: RuleParsers,
}

impl ProtectionEngine {
    pub fn new(rules: Arc<dyn RuleStore>, parsers: RuleParsers) -> Self {
        ProtectionEngine { rules, parsers }
    }

    /// Evaluate all rules of `input.repo` against the refs of one action.
    ///
    /// Rules that have nothing to say are omitted from the result.
    pub async fn verify(&self, input: &VerifyInput<'_>) -> Result<Vec<RuleViolations>, Error> {
        if input.ref_names.is_empty() {
            return Ok(Vec::new());
        }
        let rules = self.rules.list_for_repo(input.repo.id).await?;
        let mut out = Vec::new();
        for rule in rules.iter().filter(|r| r.state != RuleState::Disabled) {
            let (pattern, definition) = self.parsers.parse(rule)?;
            let names: Vec<&str> = input
                .ref_names
                .iter()
                .map(String::as_str)
                .filter(|name| pattern.matches(name, &input.repo.default_branch))
                .collect();
            if names.is_empty() {
                continue;
            }
            let verdict = definition.verify(input, &names);
            if verdict.violations.is_empty() {
                continue;
            }
            let enforced = rule.state == RuleState::Active;
            let bypassed = enforced && input.allow_bypass && verdict.can_bypass;
            tracing::debug!(
                rule = %rule.identifier,
                action = ?input.action,
                violations = verdict.violations.len(),
                bypassed,
                "protection rule violated"
            );
            out.push(RuleViolations {
                rule_id: rule.id,
                identifier: rule.identifier.clone(),
                critical: enforced && !bypassed,
                bypassed,
                violations: verdict.violations,
            });
        }
        Ok(out)
    }
}

impl std::fmt::Debug for ProtectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionEngine").field("parsers", &self.parsers).finish_non_exhaustive()
    }
}
