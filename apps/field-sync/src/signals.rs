//! Ephemeral application signals carried as channel broadcasts.

use field_bus::BroadcastMessage;
use serde::{Deserialize, Serialize};

use crate::queue::{EntityType, MutationAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum FieldSignal {
    FloorCompleted {
        building_id: String,
        floor: i32,
        holder_id: String,
    },
    HelpRequested {
        building_id: String,
        floor: i32,
        holder_id: String,
        #[serde(default)]
        note: Option<String>,
    },
    MutationApplied {
        entity_type: EntityType,
        entity_id: String,
        action: MutationAction,
    },
}

impl FieldSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            FieldSignal::FloorCompleted { .. } => "floor_completed",
            FieldSignal::HelpRequested { .. } => "help_requested",
            FieldSignal::MutationApplied { .. } => "mutation_applied",
        }
    }

    pub fn to_message(&self) -> BroadcastMessage {
        let payload = match serde_json::to_value(self) {
            Ok(mut value) => value
                .get_mut("payload")
                .map(serde_json::Value::take)
                .unwrap_or_default(),
            Err(_) => serde_json::Value::Null,
        };
        BroadcastMessage {
            event: self.event_name().to_string(),
            payload,
        }
    }

    /// `None` for broadcasts that are not field signals.
    pub fn from_message(message: &BroadcastMessage) -> Option<Self> {
        serde_json::from_value(serde_json::json!({
            "event": message.event,
            "payload": message.payload,
        }))
        .ok()
    }
}
