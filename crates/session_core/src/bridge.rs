use std::collections::HashMap;

use tokio::sync::{broadcast, Mutex};

use shared::{domain::TenantId, protocol::BridgeEvent};

const TENANT_CHANNEL_CAPACITY: usize = 256;

/// Per-tenant fan-out of live session events.
///
/// Delivery is at-most-once and best-effort: a tenant with no subscriber
/// simply misses events published while absent. Durable state is persisted
/// elsewhere, so nothing is lost that cannot be re-read.
pub struct EventBridge {
    channels: Mutex<HashMap<TenantId, broadcast::Sender<BridgeEvent>>>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, tenant_id: TenantId) -> broadcast::Receiver<BridgeEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(TENANT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub async fn publish(&self, tenant_id: TenantId, event: BridgeEvent) {
        let mut channels = self.channels.lock().await;
        let stale = match channels.get(&tenant_id) {
            Some(sender) => sender.send(event).is_err() && sender.receiver_count() == 0,
            None => false,
        };
        if stale {
            // Last subscriber is gone; drop the channel so tenants do not
            // accumulate forever.
            channels.remove(&tenant_id);
        }
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{ChannelId, SessionKey};

    fn ready_event(tenant: i64) -> BridgeEvent {
        BridgeEvent::Ready {
            session: SessionKey::new(TenantId(tenant), ChannelId(1)),
        }
    }

    #[tokio::test]
    async fn events_reach_only_the_publishing_tenant() {
        let bridge = EventBridge::new();
        let mut first = bridge.subscribe(TenantId(1)).await;
        let mut second = bridge.subscribe(TenantId(2)).await;

        bridge.publish(TenantId(1), ready_event(1)).await;

        assert!(matches!(
            first.recv().await,
            Ok(BridgeEvent::Ready { session }) if session.tenant_id == TenantId(1)
        ));
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let bridge = EventBridge::new();
        bridge.publish(TenantId(3), ready_event(3)).await;

        // A later subscriber sees only events published after subscription.
        let mut late = bridge.subscribe(TenantId(3)).await;
        bridge.publish(TenantId(3), ready_event(3)).await;
        assert!(late.recv().await.is_ok());
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn multiple_subscribers_of_one_tenant_all_receive() {
        let bridge = EventBridge::new();
        let mut a = bridge.subscribe(TenantId(4)).await;
        let mut b = bridge.subscribe(TenantId(4)).await;

        bridge.publish(TenantId(4), ready_event(4)).await;

        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
