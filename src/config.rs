use std::time::Duration;

use serde::Deserialize;

use crate::error::ChatError;

/// Tunables for the engine. Every field has a default, so a partial JSON
/// document is enough.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
	/// Messages kept in a room's in-memory log.
	pub recent_message_limit: usize,
	/// How long a typing indicator survives without being refreshed.
	pub typing_ttl_ms: u64,
	/// How long a room may stay without members before it is reclaimed.
	pub room_idle_ms: u64,
	/// Period of the room housekeeping tick.
	pub sweep_interval_ms: u64,
	/// Dead letters kept as samples.
	pub dead_letter_samples: usize,
	/// Restarts allowed per room within `restart_window_ms`.
	pub max_restarts: u32,
	pub restart_window_ms: u64,
	/// Delivery histories a session keeps for messages that reached `read`
	/// or `failed`.
	pub delivery_history_limit: usize,
}

impl Default for ChatConfig {
	fn default() -> Self {
		Self {
			recent_message_limit: 100,
			typing_ttl_ms: 6_000,
			room_idle_ms: 300_000,
			sweep_interval_ms: 1_000,
			dead_letter_samples: 32,
			max_restarts: 5,
			restart_window_ms: 10_000,
			delivery_history_limit: 256,
		}
	}
}

impl ChatConfig {
	pub fn from_json(text: &str) -> Result<Self, ChatError> {
		let config: ChatConfig = serde_json::from_str(text).map_err(|err| ChatError::Config(err.to_string()))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ChatError> {
		let positive = [
			("recent_message_limit", self.recent_message_limit as u64),
			("typing_ttl_ms", self.typing_ttl_ms),
			("room_idle_ms", self.room_idle_ms),
			("sweep_interval_ms", self.sweep_interval_ms),
			("restart_window_ms", self.restart_window_ms),
			("delivery_history_limit", self.delivery_history_limit as u64),
		];
		match positive.iter().find(|(_, value)| *value == 0) {
			Some((name, _)) => Err(ChatError::Config(format!("{name} must be greater than zero"))),
			None => Ok(()),
		}
	}

	pub fn typing_ttl(&self) -> Duration {
		Duration::from_millis(self.typing_ttl_ms)
	}

	pub fn room_idle(&self) -> Duration {
		Duration::from_millis(self.room_idle_ms)
	}

	pub fn sweep_interval(&self) -> Duration {
		Duration::from_millis(self.sweep_interval_ms)
	}

	pub fn restart_window(&self) -> Duration {
		Duration::from_millis(self.restart_window_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_document_keeps_defaults() {
		let config = ChatConfig::from_json(r#"{ "room_idle_ms": 50, "max_restarts": 1 }"#).unwrap();
		assert_eq!(config.room_idle(), Duration::from_millis(50));
		assert_eq!(config.max_restarts, 1);
		assert_eq!(config.recent_message_limit, 100);
		assert_eq!(config.delivery_history_limit, 256);
	}

	#[test]
	fn zero_interval_is_rejected() {
		let err = ChatConfig::from_json(r#"{ "sweep_interval_ms": 0 }"#).unwrap_err();
		assert!(matches!(err, ChatError::Config(msg) if msg.contains("sweep_interval_ms")));
	}

	#[test]
	fn malformed_json_is_a_config_error() {
		assert!(matches!(ChatConfig::from_json("{"), Err(ChatError::Config(_))));
	}
}
