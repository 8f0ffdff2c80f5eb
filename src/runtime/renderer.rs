//! Publish/subscribe channel to the external task renderer.
//!
//! The virtual task runs in an external game engine; the runtime exchanges
//! small topic-addressed messages with it. The channel contract is the only
//! thing the state machine depends on — transports can be swapped without
//! touching runtime logic. The in-process pair below carries the same
//! messages over tokio broadcast channels and backs both tests and
//! hardware-free dry runs.

use crate::error::{AppResult, VrError};
use serde::Deserialize;
use tokio::sync::broadcast;

// Topics published by the runtime.
pub const TOPIC_CUE_SEQUENCE_REQUEST: &str = "task/cue_sequence/request";
pub const TOPIC_GUIDANCE_ENABLE: &str = "task/guidance/enable";
pub const TOPIC_GUIDANCE_DISABLE: &str = "task/guidance/disable";
pub const TOPIC_REWARD_BOUNDARY_SHOW: &str = "task/reward_boundary/show";
pub const TOPIC_REWARD_BOUNDARY_HIDE: &str = "task/reward_boundary/hide";
pub const TOPIC_MOTION: &str = "task/motion";
pub const TOPIC_LICK: &str = "task/lick";

// Topics the runtime subscribes to.
pub const TOPIC_CUE_SEQUENCE: &str = "task/cue_sequence";
pub const TOPIC_TERMINATED: &str = "task/terminated";
pub const TOPIC_REWARD_TRIGGER: &str = "task/reward";

const CHANNEL_CAPACITY: usize = 256;

/// One topic-addressed message.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl TaskMessage {
    pub fn new(topic: &str, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
        }
    }

    /// A message with an empty payload (pure trigger).
    pub fn trigger(topic: &str) -> Self {
        Self::new(topic, Vec::new())
    }
}

/// JSON payload of the cue-sequence response.
#[derive(Debug, Deserialize)]
pub struct CueSequencePayload {
    pub cue_sequence: Vec<u8>,
}

/// Channel to the task renderer.
///
/// `try_next` must never block: the control loop drains at most one message
/// per cycle.
pub trait TaskRendererChannel: Send {
    /// Publishes one message to the renderer.
    fn publish(&mut self, message: TaskMessage) -> AppResult<()>;

    /// Returns the next pending message from the renderer, if any.
    fn try_next(&mut self) -> Option<TaskMessage>;
}

/// Runtime-side endpoint of the in-process channel pair.
pub struct ControlEndpoint {
    to_renderer: broadcast::Sender<TaskMessage>,
    from_renderer: broadcast::Receiver<TaskMessage>,
}

/// Renderer-side endpoint of the in-process channel pair.
pub struct RendererEndpoint {
    to_control: broadcast::Sender<TaskMessage>,
    from_control: broadcast::Receiver<TaskMessage>,
}

impl Clone for RendererEndpoint {
    fn clone(&self) -> Self {
        Self {
            to_control: self.to_control.clone(),
            from_control: self.from_control.resubscribe(),
        }
    }
}

/// Creates a connected in-process channel pair.
pub fn channel_pair() -> (ControlEndpoint, RendererEndpoint) {
    let (to_renderer, from_control) = broadcast::channel(CHANNEL_CAPACITY);
    let (to_control, from_renderer) = broadcast::channel(CHANNEL_CAPACITY);
    (
        ControlEndpoint {
            to_renderer,
            from_renderer,
        },
        RendererEndpoint {
            to_control,
            from_control,
        },
    )
}

impl TaskRendererChannel for ControlEndpoint {
    fn publish(&mut self, message: TaskMessage) -> AppResult<()> {
        self.to_renderer
            .send(message)
            .map_err(|_| VrError::Renderer("renderer endpoint dropped".into()))?;
        Ok(())
    }

    fn try_next(&mut self) -> Option<TaskMessage> {
        loop {
            match self.from_renderer.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("Renderer channel lagged; skipped {skipped} messages");
                }
                Err(_) => return None,
            }
        }
    }
}

impl RendererEndpoint {
    /// Publishes one message toward the runtime.
    pub fn publish(&mut self, message: TaskMessage) -> AppResult<()> {
        self.to_control
            .send(message)
            .map_err(|_| VrError::Renderer("control endpoint dropped".into()))?;
        Ok(())
    }

    /// Returns the next pending message from the runtime, if any.
    pub fn try_next(&mut self) -> Option<TaskMessage> {
        loop {
            match self.from_control.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("Control channel lagged; skipped {skipped} messages");
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_channel_pair() {
        let (mut control, mut renderer) = channel_pair();
        control
            .publish(TaskMessage::trigger(TOPIC_CUE_SEQUENCE_REQUEST))
            .expect("publish");
        let request = renderer.try_next().expect("request arrives");
        assert_eq!(request.topic, TOPIC_CUE_SEQUENCE_REQUEST);

        let payload = serde_json::to_vec(&serde_json::json!({"cue_sequence": [1, 1, 2]}))
            .expect("serialize");
        renderer
            .publish(TaskMessage::new(TOPIC_CUE_SEQUENCE, payload))
            .expect("respond");
        let response = control.try_next().expect("response arrives");
        let parsed: CueSequencePayload =
            serde_json::from_slice(&response.payload).expect("parse payload");
        assert_eq!(parsed.cue_sequence, vec![1, 1, 2]);
    }

    #[test]
    fn test_try_next_is_non_blocking_when_empty() {
        let (mut control, _renderer) = channel_pair();
        assert!(control.try_next().is_none());
    }
}
