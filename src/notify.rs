use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

/// Events a slow LISTEN connection may fall behind before it starts losing them.
pub const PAGE_BACKLOG: usize = 256;

/// Fans store events out to the connections LISTENing on each booking page.
#[derive(Default)]
pub struct NotifyHub {
    pages: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, page_id: Ulid) -> broadcast::Receiver<Event> {
        self.pages
            .entry(page_id)
            .or_insert_with(|| broadcast::channel(PAGE_BACKLOG).0)
            .subscribe()
    }

    /// Deliver `event` to every listener of `page_id` and return how many got it.
    /// A channel whose listeners have all gone is dropped here.
    pub fn send(&self, page_id: Ulid, event: &Event) -> usize {
        let delivered = match self.pages.get(&page_id) {
            None => return 0,
            Some(sender) => sender.send(event.clone()).unwrap_or(0),
        };
        if delivered == 0 {
            self.pages.remove_if(&page_id, |_, sender| sender.receiver_count() == 0);
        }
        delivered
    }

    pub fn listeners(&self, page_id: &Ulid) -> usize {
        self.pages.get(page_id).map_or(0, |sender| sender.receiver_count())
    }

    /// Close a deleted page's channel; its listeners see the stream end.
    pub fn remove(&self, page_id: &Ulid) {
        self.pages.remove(page_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    #[tokio::test]
    async fn listener_receives_page_events() {
        let hub = NotifyHub::new();
        let page = fixtures::page("notify");
        let mut rx = hub.subscribe(page.id);

        let event = Event::PageLiveSet { id: page.id, live: true };
        assert_eq!(hub.send(page.id, &event), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_pages_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let theirs = Ulid::new();
        let mut rx = hub.subscribe(mine);

        assert_eq!(hub.send(theirs, &Event::PageDeleted { id: theirs }), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_ends_the_stream() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);
        hub.remove(&pid);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }

    #[test]
    fn abandoned_channel_is_pruned_on_send() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let rx = hub.subscribe(pid);
        assert_eq!(hub.listeners(&pid), 1);

        drop(rx);
        assert_eq!(hub.send(pid, &Event::PageDeleted { id: pid }), 0);
        assert_eq!(hub.listeners(&pid), 0);
        assert!(hub.pages.is_empty());
    }
}
