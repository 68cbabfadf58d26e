use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::facts::key::FunctionKey;

/// Whether an edge target had a visible body in the reporting unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Resolved,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationFact {
    pub key: FunctionKey,
    #[serde(default)]
    pub definition: Option<FunctionKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFact {
    pub caller: FunctionKey,
    pub callee: FunctionKey,
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub is_virtual: bool,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideFact {
    pub method: FunctionKey,
    pub base: FunctionKey,
    pub resolution: Resolution,
}

/// Everything one translation unit discovered, in discovery order.
///
/// Duplicates are allowed, both within the batch and against what other
/// units already merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactBatch {
    #[serde(default)]
    pub definitions: Vec<FunctionKey>,
    #[serde(default)]
    pub declarations: Vec<DeclarationFact>,
    #[serde(default)]
    pub calls: Vec<CallFact>,
    #[serde(default)]
    pub overrides: Vec<OverrideFact>,
}

impl FactBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(input: &str) -> serde_json::Result<Self> {
        serde_json::from_str(input)
    }

    pub fn add_definition(&mut self, key: FunctionKey) -> &mut Self {
        self.definitions.push(key);
        self
    }

    pub fn add_declaration(
        &mut self,
        key: FunctionKey,
        definition: Option<FunctionKey>,
    ) -> &mut Self {
        self.declarations.push(DeclarationFact { key, definition });
        self
    }

    pub fn add_call(
        &mut self,
        caller: FunctionKey,
        callee: FunctionKey,
        line: u32,
        column: u32,
        is_virtual: bool,
        resolution: Resolution,
    ) -> &mut Self {
        self.calls.push(CallFact {
            caller,
            callee,
            line,
            column,
            is_virtual,
            resolution,
        });
        self
    }

    pub fn add_override(
        &mut self,
        method: FunctionKey,
        base: FunctionKey,
        resolution: Resolution,
    ) -> &mut Self {
        self.overrides.push(OverrideFact {
            method,
            base,
            resolution,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
            && self.declarations.is_empty()
            && self.calls.is_empty()
            && self.overrides.is_empty()
    }

    pub fn fact_count(&self) -> usize {
        self.definitions.len() + self.declarations.len() + self.calls.len() + self.overrides.len()
    }

    /// Rebases every key onto `root`. See [`FunctionKey::rebased`].
    pub fn rebase(self, root: &Path) -> Self {
        let rebase = |key: FunctionKey| key.rebased(root);
        Self {
            definitions: self.definitions.into_iter().map(rebase).collect(),
            declarations: self
                .declarations
                .into_iter()
                .map(|decl| DeclarationFact {
                    key: rebase(decl.key),
                    definition: decl.definition.map(rebase),
                })
                .collect(),
            calls: self
                .calls
                .into_iter()
                .map(|call| CallFact {
                    caller: rebase(call.caller),
                    callee: rebase(call.callee),
                    ..call
                })
                .collect(),
            overrides: self
                .overrides
                .into_iter()
                .map(|item| OverrideFact {
                    method: rebase(item.method),
                    base: rebase(item.base),
                    ..item
                })
                .collect(),
        }
    }
}
