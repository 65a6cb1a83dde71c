//! Publisher identity and delivery configuration.

use serde::Deserialize;

use crate::publisher::PublishMode;

/// Publisher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Application id, stamped on envelopes and used as default consumer group.
    pub app: String,
    /// Deploy generation, stamped on envelopes.
    pub generation: String,
    /// Topic envelopes are published to.
    pub topic: String,
    /// How publish failures surface.
    pub mode: PublishMode,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            app: "app".to_string(),
            generation: "0".to_string(),
            topic: "promulgate.events".to_string(),
            mode: PublishMode::FireAndForget,
        }
    }
}
