//! Rule bundle loading and evaluation.
//!
//! A bundle is every `*.toml` file in the policy directory, read in filename
//! order. Each file holds `[[rule]]` tables:
//!
//! ```toml
//! version = "2026.1"
//!
//! [[rule]]
//! name = "block_high_risk"
//! class = "deny"
//! msg = "Risk exceeds the block threshold"
//! when = "score.value >= thresholds.block"
//! ```
//!
//! The `when` text is kept verbatim as the receipt's source snippet. A rule
//! whose condition fails to parse still loads; it evaluates as a fired deny
//! with `rule_error: <name>` so a broken rule fails closed instead of
//! silently allowing.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use gitguard_types::{PolicyDecision, PolicyDeny, PolicyReceipt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::{self, EvalCtx, Expr, ExprError};

/// Whether a rule grants or blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleClass {
    Allow,
    Deny,
}

#[derive(Debug, Deserialize)]
struct BundleFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default, rename = "rule")]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    name: String,
    class: RuleClass,
    #[serde(default)]
    msg: Option<String>,
    when: String,
}

/// A loaded rule: its metadata, verbatim source, and compiled condition.
pub struct Rule {
    pub name: String,
    pub class: RuleClass,
    /// Deny message; defaults to `denied by <name>` when omitted.
    pub msg: Option<String>,
    /// Verbatim `when` text, cited in receipts.
    pub source: String,
    compiled: Result<Expr, ExprError>,
}

impl Rule {
    fn deny_msg(&self) -> String {
        self.msg
            .clone()
            .unwrap_or_else(|| format!("denied by {}", self.name))
    }
}

/// An immutable snapshot of loaded rules. Reload builds a fresh bundle and
/// swaps the pointer; in-flight evaluations keep the snapshot they started
/// with.
pub struct Bundle {
    /// Highest `version` key across bundle files, `"unversioned"` if none.
    pub version: String,
    pub rules: Vec<Rule>,
}

impl Bundle {
    /// Load every `*.toml` file under `dir`, in filename order.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            bail!("policy bundle dir not found: {}", dir.display());
        }
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read policy dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();
        if paths.is_empty() {
            bail!("policy bundle dir has no .toml files: {}", dir.display());
        }

        let mut rules = Vec::new();
        let mut versions = BTreeSet::new();
        for path in &paths {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read policy file {}", path.display()))?;
            let file: BundleFile = toml::from_str(&text)
                .with_context(|| format!("failed to parse policy file {}", path.display()))?;
            if let Some(version) = file.version {
                versions.insert(version);
            }
            for spec in file.rules {
                rules.push(compile(spec));
            }
        }
        Self::from_rules(rules, versions)
    }

    /// Build a bundle from a single TOML document. Used by tests and by
    /// embedded default bundles.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: BundleFile = toml::from_str(text).context("failed to parse policy TOML")?;
        let mut versions = BTreeSet::new();
        if let Some(version) = file.version {
            versions.insert(version);
        }
        let rules = file.rules.into_iter().map(compile).collect();
        Self::from_rules(rules, versions)
    }

    fn from_rules(rules: Vec<Rule>, versions: BTreeSet<String>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for rule in &rules {
            if !seen.insert(rule.name.clone()) {
                bail!("duplicate rule name in bundle: {}", rule.name);
            }
        }
        if rules.is_empty() {
            bail!("policy bundle has no rules");
        }
        let version = versions
            .into_iter()
            .next_back()
            .unwrap_or_else(|| "unversioned".to_string());
        Ok(Self { version, rules })
    }

    /// Names of all loaded rules, in evaluation order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Evaluate every rule against the input document.
    ///
    /// `allow == (no deny fired && at least one allow rule fired)`. Every
    /// evaluated rule gets a receipt, fired or not.
    pub fn evaluate(&self, input: &Value) -> PolicyDecision {
        let mut denies = Vec::new();
        let mut receipts = Vec::new();
        let mut allow_fired = false;

        for rule in &self.rules {
            let ctx = EvalCtx::new(input);
            let outcome = match &rule.compiled {
                Ok(expr) => expr::eval_bool(expr, &ctx),
                Err(parse_err) => Err(parse_err.clone()),
            };
            let fired = match outcome {
                Ok(true) => {
                    match rule.class {
                        RuleClass::Allow => allow_fired = true,
                        RuleClass::Deny => denies.push(PolicyDeny {
                            rule: rule.name.clone(),
                            msg: rule.deny_msg(),
                        }),
                    }
                    true
                }
                Ok(false) => false,
                Err(_) => {
                    // Fail closed: an erroring rule denies regardless of its
                    // declared class.
                    denies.push(PolicyDeny {
                        rule: rule.name.clone(),
                        msg: format!("rule_error: {}", rule.name),
                    });
                    true
                }
            };
            receipts.push(PolicyReceipt {
                rule_name: rule.name.clone(),
                source_snippet: rule.source.clone(),
                inputs_used: ctx.inputs_used(),
                fired,
            });
        }

        PolicyDecision {
            allow: denies.is_empty() && allow_fired,
            denies,
            receipts,
        }
    }
}

fn compile(spec: RuleSpec) -> Rule {
    let compiled = expr::parse(&spec.when);
    Rule {
        name: spec.name,
        class: spec.class,
        msg: spec.msg,
        source: spec.when,
        compiled,
    }
}
