//! Wires a source, the change detector and the transcode worker together.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, unbounded};

use crate::{
    artwork::{
        store::ArtworkStore,
        transcode::{self, Transcoder},
    },
    notify::NotifierHandle,
    pipeline::detector::ChangeDetector,
    source::{self, Source},
};

pub mod detector;

pub struct Pipeline {
    pump: JoinHandle<()>,
    detector: JoinHandle<()>,
    transcoder: JoinHandle<()>,
}

impl Pipeline {
    /// Spawns the pipeline threads. Events flow until `source` ends.
    pub fn start<S>(
        source: S,
        transcoder: Transcoder,
        store: Arc<ArtworkStore>,
        notifier: NotifierHandle,
        queue_depth: usize,
    ) -> Self
    where
        S: Source + 'static,
    {
        let (events_tx, events_rx) = bounded(queue_depth);
        let (jobs_tx, jobs_rx) = bounded(queue_depth);
        // Unbounded so the worker never waits on a detector that is waiting on it.
        let (outcomes_tx, outcomes_rx) = unbounded();

        let transcoder = transcode::spawn_worker(transcoder, jobs_rx, outcomes_tx);
        let detector = ChangeDetector::new(store, notifier);
        let detector = thread::spawn(move || detector.run(events_rx, jobs_tx, outcomes_rx));
        let pump = source::spawn_pump(source, events_tx);

        Self {
            pump,
            detector,
            transcoder,
        }
    }

    pub fn join(self) -> thread::Result<()> {
        self.pump.join()?;
        self.detector.join()?;
        self.transcoder.join()
    }
}
