use async_trait::async_trait;
use jobflow_core::SchedulerResult;
use jobflow_domain::{DomainEvent, EventPublisher, EventRecord};
use tokio::sync::broadcast;
use tracing::trace;

/// 基于broadcast通道的事件发布器, 没有订阅者时事件直接丢弃
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<EventRecord>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: DomainEvent) -> SchedulerResult<()> {
        trace!("发布事件: {}", event.event_type());
        let _ = self.sender.send(EventRecord::now(event));
        Ok(())
    }
}
