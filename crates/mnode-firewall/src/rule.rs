//! iptables rule builders
//!
//! A [`Rule`] knows how to put itself into a chain and how to take itself
//! back out again, which is what lets every apply hand back an undo.

use crate::exec::{ExecError, RuleExecutor};
use std::sync::Arc;
use tracing::warn;

pub(crate) const APPEND: &str = "-A";
pub(crate) const INSERT: &str = "-I";
pub(crate) const DELETE: &str = "-D";
pub(crate) const NEW_CHAIN: &str = "-N";
pub(crate) const LIST_RULES: &str = "-S";
pub(crate) const FLUSH_CHAIN: &str = "-F";
pub(crate) const DELETE_CHAIN: &str = "-X";
pub(crate) const VERSION: &str = "--version";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    Append,
    Insert(u32),
}

/// A single rule targeting a named chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    chain: String,
    placement: Placement,
    spec: Vec<String>,
}

impl Rule {
    /// Rule appended at the end of `chain`
    pub fn append_to(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            placement: Placement::Append,
            spec: Vec::new(),
        }
    }

    /// Rule inserted at `position` (1-based) of `chain`
    pub fn insert_at(chain: impl Into<String>, position: u32) -> Self {
        Self {
            chain: chain.into(),
            placement: Placement::Insert(position),
            spec: Vec::new(),
        }
    }

    /// Set the match/target part of the rule
    pub fn spec<I, S>(mut self, spec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec = spec.into_iter().map(Into::into).collect();
        self
    }

    /// Chain this rule lives in
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Arguments that install the rule
    pub fn apply_args(&self) -> Vec<String> {
        let mut args = match self.placement {
            Placement::Append => vec![APPEND.to_string(), self.chain.clone()],
            Placement::Insert(position) => vec![
                INSERT.to_string(),
                self.chain.clone(),
                position.to_string(),
            ],
        };
        args.extend(self.spec.iter().cloned());
        args
    }

    /// Arguments that delete the rule, regardless of where it was placed
    pub fn remove_args(&self) -> Vec<String> {
        let mut args = vec![DELETE.to_string(), self.chain.clone()];
        args.extend(self.spec.iter().cloned());
        args
    }
}

/// Install `rule` and return the closure that deletes it again.
///
/// A failed delete is only logged; there is nobody left to hand the error to.
pub fn add_rule_with_removal(
    executor: &Arc<dyn RuleExecutor>,
    rule: Rule,
) -> Result<Box<dyn FnOnce() + Send>, ExecError> {
    executor.exec(&rule.apply_args())?;

    let executor = Arc::clone(executor);
    Ok(Box::new(move || {
        let args = rule.remove_args();
        if let Err(err) = executor.exec(&args) {
            warn!(%err, args = ?args, "error removing rule, you might want to do it yourself");
        }
    }))
}

/// Turn a listed rule (`-A CHAIN ...`) into its delete form (`-D CHAIN ...`)
pub(crate) fn delete_args_for_listed(rule: &str) -> Vec<String> {
    rule.replacen(APPEND, DELETE, 1)
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}
