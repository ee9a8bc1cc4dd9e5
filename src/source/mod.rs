//! Adapters that turn an external now-playing feed into [`SourceEvent`]s.
//!
//! A source is just an endless iterator of events. Each adapter handles its own
//! reconnects and reports failures as `SourceError` events instead of ending.

use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use log::debug;
use thiserror::Error;

use crate::{
    config::SourceConfig,
    domain::event::SourceEvent,
    source::{device::DevicePoller, discovery::HttpNowPlayingClient, mqtt::BusSubscriber},
};

pub mod backoff;
pub mod device;
pub mod discovery;
pub mod mqtt;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("device '{0}' not found")]
    NotFound(String),

    #[error("device query failed: {0}")]
    Query(String),
}

pub trait Source: Iterator<Item = SourceEvent> + Send {}

impl<T> Source for T where T: Iterator<Item = SourceEvent> + Send {}

/// Builds the adapter selected by the configuration.
pub fn build(config: SourceConfig<'_>) -> Box<dyn Source> {
    match config {
        SourceConfig::Mqtt(mqtt) => Box::new(BusSubscriber::new(mqtt)),
        SourceConfig::Device(device) => Box::new(DevicePoller::new(
            HttpNowPlayingClient::new(device),
            device.poll_interval(),
        )),
    }
}

/// Moves events from a source into the pipeline queue.
///
/// A full queue blocks the source, so nothing it produced is dropped.
pub fn spawn_pump<S>(source: S, queue: Sender<SourceEvent>) -> JoinHandle<()>
where
    S: Source + 'static,
{
    thread::spawn(move || {
        for event in source {
            if queue.send(event).is_err() {
                debug!("event queue closed, stopping source");
                return;
            }
        }
        debug!("source ended");
    })
}
