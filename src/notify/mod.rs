//! Forwards pipeline transitions to the display's automation API.
//!
//! [`NotifierHandle::notify`] never blocks: invocations go through a
//! drop-oldest queue that a dedicated worker drains while it owns the
//! connection to the device.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

use crate::{
    config::{Actions, EspHomeConfig},
    domain::event::NotifyEvent,
    notify::{esphome::EspHomeClient, queue::DropOldestQueue, worker::NotifierWorker},
};

pub mod error;
pub mod esphome;
pub mod queue;
pub mod worker;

/// One remote action call, as it waits in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub action: String,
    pub argument: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NotifierHandle {
    target: Option<Target>,
}

#[derive(Debug, Clone)]
struct Target {
    actions: Arc<Actions>,
    queue: DropOldestQueue<Invocation>,
    // Dropping the last handle disconnects this, which stops an idle worker.
    _lifeline: Sender<()>,
}

/// Worker side of a notifier channel.
#[derive(Debug)]
pub struct Inbox {
    pub invocations: Receiver<Invocation>,
    pub lifeline: Receiver<()>,
}

impl NotifierHandle {
    /// A handle that discards every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub fn notify(&self, event: &NotifyEvent) {
        let Some(target) = &self.target else {
            return;
        };
        let Some(action) = target.actions.action_for(event.kind()) else {
            debug!("no action mapped for {:?}, skipping", event.kind());
            return;
        };

        let invocation = Invocation {
            action: action.to_string(),
            argument: event.argument(),
        };
        if let Some(dropped) = target.queue.push(invocation) {
            warn!(
                "notification queue full ({} pending), dropped '{}' call",
                target.queue.len(),
                dropped.action
            );
        }
    }
}

/// Creates a connected handle and inbox pair.
pub fn channel(actions: Actions, depth: usize) -> (NotifierHandle, Inbox) {
    let queue = DropOldestQueue::new(depth);
    let (lifeline_tx, lifeline_rx) = crossbeam_channel::bounded(0);
    let inbox = Inbox {
        invocations: queue.receiver(),
        lifeline: lifeline_rx,
    };
    let handle = NotifierHandle {
        target: Some(Target {
            actions: Arc::new(actions),
            queue,
            _lifeline: lifeline_tx,
        }),
    };
    (handle, inbox)
}

/// Starts the ESPHome notifier worker.
pub fn spawn(config: &EspHomeConfig) -> (NotifierHandle, JoinHandle<()>) {
    let (handle, inbox) = channel(config.actions.clone(), config.queue_depth);
    let worker = NotifierWorker::new(
        EspHomeClient::new(config),
        inbox,
        config.max_attempts,
        config.keepalive(),
    );
    let thread = thread::spawn(move || worker.run());
    (handle, thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::track::MetadataField;

    fn actions() -> Actions {
        Actions {
            artwork_changed: Some("refresh_cover".into()),
            title_changed: Some("set_title".into()),
            artist_changed: None,
            album_changed: Some("  ".into()),
        }
    }

    #[test]
    fn mapped_events_become_invocations() {
        let (handle, inbox) = channel(actions(), 4);

        handle.notify(&NotifyEvent::ArtworkChanged);
        handle.notify(&NotifyEvent::TitleChanged(Some("Song".into())));
        handle.notify(&NotifyEvent::field_changed(MetadataField::Title, None));

        let queued: Vec<_> = inbox.invocations.try_iter().collect();
        assert_eq!(
            queued,
            vec![
                Invocation {
                    action: "refresh_cover".into(),
                    argument: None
                },
                Invocation {
                    action: "set_title".into(),
                    argument: Some("Song".into())
                },
                Invocation {
                    action: "set_title".into(),
                    argument: Some(String::new())
                },
            ]
        );
    }

    #[test]
    fn unmapped_events_are_never_queued() {
        let (handle, inbox) = channel(actions(), 4);

        handle.notify(&NotifyEvent::ArtistChanged(Some("Band".into())));
        handle.notify(&NotifyEvent::AlbumChanged(Some("Record".into())));

        assert!(inbox.invocations.is_empty());
    }

    #[test]
    fn overflow_keeps_the_newest_calls() {
        let (handle, inbox) = channel(actions(), 2);

        for title in ["a", "b", "c"] {
            handle.notify(&NotifyEvent::TitleChanged(Some(title.into())));
        }

        let arguments: Vec<_> = inbox
            .invocations
            .try_iter()
            .filter_map(|invocation| invocation.argument)
            .collect();
        assert_eq!(arguments, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn disabled_handle_ignores_everything() {
        let handle = NotifierHandle::disabled();

        assert!(!handle.is_enabled());
        handle.notify(&NotifyEvent::ArtworkChanged);
    }

    #[test]
    fn dropping_every_handle_closes_the_lifeline() {
        let (handle, inbox) = channel(actions(), 2);
        let clone = handle.clone();

        drop(handle);
        assert!(matches!(
            inbox.lifeline.try_recv(),
            Err(crossbeam_channel::TryRecvError::Empty)
        ));

        drop(clone);
        assert!(matches!(
            inbox.lifeline.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
    }
}
