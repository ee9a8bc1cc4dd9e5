use std::{collections::VecDeque, sync::Arc};

use crossbeam_channel::{Receiver, Sender, never, select};
use log::{debug, error, info, warn};

use crate::{
    artwork::{
        store::ArtworkStore,
        transcode::{TranscodeJob, TranscodeOutcome},
    },
    domain::{
        event::{NotifyEvent, SourceEvent},
        hash::ContentHash,
        track::{DeviceAvailability, MetadataField, TrackMetadata},
    },
    notify::NotifierHandle,
};

/// What the pipeline currently believes is playing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    pub metadata: TrackMetadata,
    pub last_artwork_hash: Option<ContentHash>,
    pub availability: DeviceAvailability,
}

/// Turns raw source events into logical changes.
///
/// Owns [`PipelineState`]. Artwork is handed to the transcode worker as a
/// [`TranscodeJob`] and only becomes current once its outcome comes back.
pub struct ChangeDetector {
    state: PipelineState,
    // Most recent artwork handed to the transcoder since the last reset,
    // whatever became of it.
    last_attempted: Option<ContentHash>,
    generation: u64,
    // Submitted jobs in submission order, as (generation, hash).
    in_flight: VecDeque<(u64, ContentHash)>,
    store: Arc<ArtworkStore>,
    notifier: NotifierHandle,
}

impl ChangeDetector {
    pub fn new(store: Arc<ArtworkStore>, notifier: NotifierHandle) -> Self {
        Self {
            state: PipelineState::default(),
            last_attempted: None,
            generation: 0,
            in_flight: VecDeque::new(),
            store,
            notifier,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Applies one source event, returning artwork that needs transcoding.
    pub fn handle_event(&mut self, event: SourceEvent) -> Option<TranscodeJob> {
        match event {
            SourceEvent::ArtworkReceived(artwork) => {
                let hash = artwork.content_hash;
                if self.is_duplicate(hash) {
                    debug!("artwork {} unchanged, skipping", hash.short());
                    return None;
                }
                self.last_attempted = Some(hash);
                self.in_flight.push_back((self.generation, hash));
                Some(TranscodeJob {
                    generation: self.generation,
                    artwork,
                })
            }
            SourceEvent::MetadataChanged(metadata) => {
                self.apply_metadata(metadata);
                None
            }
            SourceEvent::AvailabilityChanged(availability) => {
                self.apply_availability(availability);
                None
            }
            SourceEvent::SourceError(reason) => {
                warn!("source error: {reason}");
                None
            }
        }
    }

    /// Compares against the artwork that will be current once every pending
    /// job is done: the newest live job, or else the last attempt and the
    /// published artwork.
    fn is_duplicate(&self, hash: ContentHash) -> bool {
        let newest_live = self
            .in_flight
            .back()
            .filter(|(generation, _)| *generation == self.generation)
            .map(|(_, newest)| *newest);

        match newest_live {
            Some(newest) => newest == hash,
            None => {
                self.last_attempted == Some(hash) || self.state.last_artwork_hash == Some(hash)
            }
        }
    }

    fn apply_metadata(&mut self, metadata: TrackMetadata) {
        for field in MetadataField::ALL {
            let value = metadata.field(field);
            if self.state.metadata.field(field) != value {
                debug!("{field:?} changed to {value:?}");
                self.notifier
                    .notify(&NotifyEvent::field_changed(field, value.map(str::to_owned)));
            }
        }
        self.state.metadata = metadata;
    }

    fn apply_availability(&mut self, availability: DeviceAvailability) {
        if self.state.availability == availability {
            return;
        }
        info!(
            "device availability {:?} -> {availability:?}",
            self.state.availability
        );
        if availability == DeviceAvailability::Offline {
            // Outcomes of jobs submitted before this point are discarded.
            self.generation += 1;
            self.state.last_artwork_hash = None;
            self.last_attempted = None;
        }
        self.state.availability = availability;
    }

    /// Publishes a finished transcode unless an offline reset overtook it.
    pub fn handle_outcome(&mut self, outcome: TranscodeOutcome) {
        self.in_flight.pop_front();
        let hash = outcome.hash;

        if outcome.generation != self.generation {
            debug!("discarding artwork {} from before a reset", hash.short());
            return;
        }

        match outcome.result {
            Ok(_) if self.state.last_artwork_hash == Some(hash) => {
                debug!("artwork {} is already current", hash.short());
            }
            Ok(snapshot) => {
                self.state.last_artwork_hash = Some(hash);
                self.store.publish(snapshot);
                info!("published artwork {}", hash.short());
                self.notifier.notify(&NotifyEvent::ArtworkChanged);
            }
            Err(err) => error!("failed to transcode artwork {}: {err}", hash.short()),
        }
    }

    /// Runs until the source queue is closed and every submitted job is done.
    pub fn run(
        mut self,
        events: Receiver<SourceEvent>,
        jobs: Sender<TranscodeJob>,
        outcomes: Receiver<TranscodeOutcome>,
    ) {
        let closed = never();
        let mut source_open = true;
        debug!(
            "change detector started, notifications {}",
            if self.notifier.is_enabled() { "on" } else { "off" }
        );

        while source_open || !self.in_flight.is_empty() {
            let source = if source_open { &events } else { &closed };
            select! {
                recv(source) -> event => match event {
                    Ok(event) => {
                        if let Some(job) = self.handle_event(event) {
                            if jobs.send(job).is_err() {
                                error!("transcode worker is gone, stopping detector");
                                return;
                            }
                        }
                    }
                    Err(_) => {
                        debug!("source queue closed");
                        source_open = false;
                    }
                },
                recv(outcomes) -> outcome => match outcome {
                    Ok(outcome) => self.handle_outcome(outcome),
                    Err(_) => {
                        error!("transcode worker stopped unexpectedly");
                        return;
                    }
                },
            }
        }
        debug!("change detector stopped");
    }
}
