use crate::core::BundleId;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleEventKind {
    Installed,
    Resolved,
    Starting,
    Started,
    Stopping,
    Stopped,
    Updated,
    Unresolved,
    Uninstalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleEvent {
    pub kind: BundleEventKind,
    pub bundle: BundleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameworkEvent {
    PackagesRefreshed { bundles: Vec<BundleId> },
    Error { bundle: Option<BundleId>, message: String },
    Warning { bundle: Option<BundleId>, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Event {
    Bundle(BundleEvent),
    Framework(FrameworkEvent),
}

impl Event {
    pub fn bundle_kind(&self) -> Option<(BundleEventKind, BundleId)> {
        match self {
            Event::Bundle(e) => Some((e.kind, e.bundle)),
            Event::Framework(_) => None,
        }
    }
}

/// Fan-out of framework events. Publishing never blocks; a subscriber that
/// falls more than the channel capacity behind sees `Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        trace!(?event, "publishing event");
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn bundle(&self, kind: BundleEventKind, bundle: BundleId) {
        self.publish(Event::Bundle(BundleEvent { kind, bundle }));
    }

    pub fn framework(&self, event: FrameworkEvent) {
        self.publish(Event::Framework(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.bundle(BundleEventKind::Installed, 1);
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.bundle(BundleEventKind::Installed, 1);
        bus.framework(FrameworkEvent::PackagesRefreshed { bundles: vec![1] });

        assert_eq!(
            rx.try_recv().unwrap().bundle_kind(),
            Some((BundleEventKind::Installed, 1))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Framework(FrameworkEvent::PackagesRefreshed { bundles: vec![1] })
        );
    }
}
