use crate::types::EngineEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EngineState, RequestId};

    #[tokio::test]
    async fn test_subscribers_see_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = RequestId::new();
        bus.publish(EngineEvent::StateChanged {
            request_id: id.clone(),
            state: EngineState::Executing,
        });
        match rx.recv().await.unwrap() {
            EngineEvent::StateChanged { request_id, state } => {
                assert_eq!(request_id, id);
                assert_eq!(state, EngineState::Executing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::RequestStarted {
            request_id: RequestId::new(),
            query: "hi".into(),
        });
    }
}
