//! Declarative policy evaluation with receipts.
//!
//! This crate is the sandboxed rule engine behind governance decisions.
//! Rules are loaded from TOML bundles on disk, evaluated against a
//! JSON-shaped input document, and every evaluation returns both the verdict
//! and a receipt per rule: the verbatim rule source, the input fields the
//! rule dereferenced, and whether it fired. Rules are never opaque.
//!
//! Time never comes from the wall clock. Callers put a pre-split `now`
//! (`rfc3339`, `weekday`, `hour`, `tz`) into the input document, which keeps
//! evaluation pure and hermetic under test.
//!
//! # Example
//!
//! ```
//! use gitguard_policy::Bundle;
//! use serde_json::json;
//!
//! let bundle = Bundle::from_toml_str(r#"
//! [[rule]]
//! name = "base_allow"
//! class = "allow"
//! when = 'action != ""'
//! "#).expect("load");
//!
//! let decision = bundle.evaluate(&json!({"action": "opened"}));
//! assert!(decision.allow);
//! ```

mod bundle;
mod expr;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde_json::Value;

pub use bundle::{Bundle, Rule, RuleClass};
pub use expr::{EvalCtx, Expr, ExprError, eval_bool, parse};

use gitguard_types::PolicyDecision;

/// The process-wide policy engine: a reloadable bundle snapshot.
///
/// Reload builds the new bundle off to the side and swaps the `Arc` under a
/// short write lock; evaluations clone the `Arc` first, so in-flight work
/// keeps its snapshot and a failed reload leaves the old bundle serving.
pub struct PolicyEngine {
    dir: PathBuf,
    bundle: RwLock<Arc<Bundle>>,
}

impl PolicyEngine {
    /// Load the bundle from `dir` and build the engine.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let bundle = Bundle::load_dir(&dir)?;
        Ok(Self {
            dir,
            bundle: RwLock::new(Arc::new(bundle)),
        })
    }

    /// Re-read the bundle directory and swap atomically.
    ///
    /// On error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<()> {
        let fresh = Arc::new(Bundle::load_dir(&self.dir)?);
        *self.bundle.write().expect("policy lock poisoned") = fresh;
        Ok(())
    }

    /// The current bundle snapshot.
    pub fn snapshot(&self) -> Arc<Bundle> {
        Arc::clone(&self.bundle.read().expect("policy lock poisoned"))
    }

    /// Version label of the current snapshot, used in dead-letter
    /// annotations.
    pub fn version(&self) -> String {
        self.snapshot().version.clone()
    }

    /// Evaluate the current snapshot against an input document.
    pub fn evaluate(&self, input: &Value) -> PolicyDecision {
        self.snapshot().evaluate(input)
    }
}
