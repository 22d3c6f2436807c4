use std::collections::BTreeSet;

use serde_json::Value;

use credeval_core::domain::catalog::{CatalogId, CatalogTable};
use credeval_core::domain::conversation::ConversationState;

use crate::tools::ToolRegistry;

/// Whether a model-asserted catalog id may be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdProvenance {
    /// A successful tool execution in this conversation returned the id.
    Traced,
    /// No tool execution returned it; treat the claim as absent.
    Untraced,
}

/// Every `(table, id)` pair that a successful tool execution returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvenanceIndex {
    seen: BTreeSet<(CatalogTable, CatalogId)>,
}

impl ProvenanceIndex {
    pub fn from_conversation(conversation: &ConversationState, tools: &ToolRegistry) -> Self {
        let mut index = Self::default();
        for record in conversation.tool_records() {
            let (Some(table), Some(payload)) = (tools.table_for(record.tool_name()), record.payload())
            else {
                continue;
            };
            index.absorb(table, payload);
        }
        index
    }

    fn absorb(&mut self, table: CatalogTable, payload: &Value) {
        let Some(matches) = payload.get("matches").and_then(Value::as_array) else {
            return;
        };
        for id in matches.iter().filter_map(|entry| entry.get("id").and_then(Value::as_str)) {
            self.insert(table, CatalogId::from(id));
        }
    }

    pub fn insert(&mut self, table: CatalogTable, id: CatalogId) {
        self.seen.insert((table, id));
    }

    pub fn check(&self, table: CatalogTable, id: &CatalogId) -> IdProvenance {
        if self.seen.contains(&(table, id.clone())) {
            IdProvenance::Traced
        } else {
            IdProvenance::Untraced
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
