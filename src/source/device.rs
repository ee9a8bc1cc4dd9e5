//! Polling source for devices that only answer "what is playing now?".

use std::{collections::VecDeque, thread, time::Duration};

use log::warn;

use crate::{
    domain::{artwork::RawArtwork, event::SourceEvent, track::TrackMetadata},
    source::{SourceError, backoff::Backoff},
};

/// One answer from the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlaying {
    pub metadata: TrackMetadata,
    pub artwork: Option<Vec<u8>>,
}

pub trait NowPlayingClient: Send {
    fn now_playing(&mut self) -> Result<NowPlaying, SourceError>;
}

/// Queries the device every `interval` and reports what it says.
///
/// The same artwork is reported on every poll; deduplication happens
/// downstream. This source never reports availability.
pub struct DevicePoller<C> {
    client: C,
    interval: Duration,
    backoff: Backoff,
    pending: VecDeque<SourceEvent>,
    next_delay: Option<Duration>,
}

impl<C: NowPlayingClient> DevicePoller<C> {
    pub fn new(client: C, interval: Duration) -> Self {
        Self::with_backoff(client, interval, Backoff::default())
    }

    pub fn with_backoff(client: C, interval: Duration, backoff: Backoff) -> Self {
        Self {
            client,
            interval,
            backoff,
            pending: VecDeque::new(),
            next_delay: None,
        }
    }

    fn poll(&mut self) -> Option<SourceEvent> {
        match self.client.now_playing() {
            Ok(now_playing) => {
                self.backoff.reset();
                self.next_delay = Some(self.interval);
                self.pending
                    .push_back(SourceEvent::MetadataChanged(now_playing.metadata));
                if let Some(bytes) = now_playing.artwork {
                    self.pending
                        .push_back(SourceEvent::ArtworkReceived(RawArtwork::new(bytes)));
                }
                None
            }
            Err(e) => {
                let delay = self.backoff.next_delay().max(self.interval);
                warn!("device poll failed: {e}, retrying in {delay:?}");
                self.next_delay = Some(delay);
                Some(SourceEvent::SourceError(e.to_string()))
            }
        }
    }
}

impl<C: NowPlayingClient> Iterator for DevicePoller<C> {
    type Item = SourceEvent;

    fn next(&mut self) -> Option<SourceEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if let Some(delay) = self.next_delay.take() {
                thread::sleep(delay);
            }
            if let Some(error) = self.poll() {
                return Some(error);
            }
        }
    }
}
