//! Now-playing client for devices found through mDNS.
//!
//! The device is looked up by its instance name, then asked for a small JSON
//! document describing the current track. Artwork is fetched separately from
//! the URL the document points at.

use std::{
    io::Read,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde::Deserialize;

use crate::{
    config::DeviceConfig,
    domain::track::TrackMetadata,
    source::{
        SourceError,
        device::{NowPlaying, NowPlayingClient},
    },
};

const DISCOVERY_POLL: Duration = Duration::from_millis(250);
const ARTWORK_ATTEMPTS: u32 = 5;
const ARTWORK_RETRY_BASE: Duration = Duration::from_millis(50);
const MAX_ARTWORK_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct NowPlayingDocument {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    #[serde(default = "playing_by_default")]
    playing: bool,
    artwork_url: Option<String>,
}

fn playing_by_default() -> bool {
    true
}

impl NowPlayingDocument {
    fn metadata(&self) -> TrackMetadata {
        let clean = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        TrackMetadata {
            title: clean(&self.title),
            artist: clean(&self.artist),
            album: clean(&self.album),
        }
    }
}

pub struct HttpNowPlayingClient {
    device_name: String,
    service_type: String,
    now_playing_path: String,
    discovery_timeout: Duration,
    agent: ureq::Agent,
    base_url: Option<String>,
}

impl HttpNowPlayingClient {
    pub fn new(config: &DeviceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build();

        Self {
            device_name: config.name.clone(),
            service_type: config.service_type.clone(),
            now_playing_path: config.now_playing_path.clone(),
            discovery_timeout: Duration::from_millis(config.discovery_timeout_ms),
            agent,
            base_url: None,
        }
    }

    fn base_url(&mut self) -> Result<String, SourceError> {
        if let Some(url) = &self.base_url {
            return Ok(url.clone());
        }
        info!("searching for '{}' on the network...", self.device_name);
        let url = self.discover()?;
        info!("found '{}' at {url}", self.device_name);
        self.base_url = Some(url.clone());
        Ok(url)
    }

    fn discover(&self) -> Result<String, SourceError> {
        let mdns = ServiceDaemon::new()
            .map_err(|e| SourceError::Connection(format!("failed to start mDNS daemon: {e}")))?;
        let receiver = match mdns.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                if let Err(e) = mdns.shutdown() {
                    debug!("failed to shut down mDNS daemon: {e}");
                }
                return Err(SourceError::Connection(format!(
                    "failed to browse {}: {e}",
                    self.service_type
                )));
            }
        };

        let deadline = Instant::now() + self.discovery_timeout;
        let mut found = None;
        while found.is_none() && Instant::now() < deadline {
            let timeout = deadline
                .saturating_duration_since(Instant::now())
                .min(DISCOVERY_POLL);
            let Ok(event) = receiver.recv_timeout(timeout) else {
                continue;
            };
            if let ServiceEvent::ServiceResolved(service) = event {
                let name = instance_name(service.get_fullname(), &self.service_type);
                if !name.eq_ignore_ascii_case(&self.device_name) {
                    debug!("skipping mDNS service '{name}'");
                    continue;
                }
                let mut addresses: Vec<_> = service.get_addresses_v4().iter().copied().collect();
                addresses.sort();
                found = addresses
                    .first()
                    .map(|address| format!("http://{address}:{}", service.get_port()));
            }
        }

        if let Err(e) = mdns.stop_browse(&self.service_type) {
            debug!("failed to stop mDNS browse cleanly: {e}");
        }
        if let Err(e) = mdns.shutdown() {
            debug!("failed to shut down mDNS daemon: {e}");
        }

        found.ok_or_else(|| SourceError::NotFound(self.device_name.clone()))
    }

    fn fetch_document(&self, base_url: &str) -> Result<NowPlayingDocument, SourceError> {
        let url = join_url(base_url, &self.now_playing_path);
        self.agent
            .get(&url)
            .call()
            .map_err(|e| request_error(&url, e))?
            .into_json()
            .map_err(|e| SourceError::Query(format!("invalid now-playing document: {e}")))
    }

    /// The device answers 503 while it is still preparing artwork for a new
    /// track, so those answers are retried a few times.
    fn fetch_artwork(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let mut attempt = 0;
        loop {
            match self.agent.get(url).call() {
                Ok(response) => {
                    let mut bytes = Vec::new();
                    response
                        .into_reader()
                        .take(MAX_ARTWORK_BYTES)
                        .read_to_end(&mut bytes)
                        .map_err(|e| SourceError::Query(format!("failed to read artwork: {e}")))?;
                    return Ok(bytes);
                }
                Err(e) if is_transient(&e) && attempt + 1 < ARTWORK_ATTEMPTS => {
                    let delay = ARTWORK_RETRY_BASE * 2u32.pow(attempt);
                    warn!(
                        "artwork not ready on attempt {}, retrying in {delay:?}",
                        attempt + 1
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(request_error(url, e)),
            }
        }
    }

    fn query(&mut self) -> Result<NowPlaying, SourceError> {
        let base_url = self.base_url()?;
        let document = self.fetch_document(&base_url)?;
        let metadata = document.metadata();

        let artwork = match (&document.artwork_url, document.playing) {
            (Some(artwork_url), true) => {
                Some(self.fetch_artwork(&join_url(&base_url, artwork_url))?)
            }
            _ => None,
        };

        Ok(NowPlaying { metadata, artwork })
    }
}

impl NowPlayingClient for HttpNowPlayingClient {
    fn now_playing(&mut self) -> Result<NowPlaying, SourceError> {
        let result = self.query();
        if result.is_err() {
            // The device may have moved; look it up again next time.
            self.base_url = None;
        }
        result
    }
}

fn instance_name(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", service_type.trim_start_matches('.'));
    fullname
        .trim()
        .strip_suffix(&suffix)
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn is_transient(error: &ureq::Error) -> bool {
    match error {
        ureq::Error::Status(code, _) => matches!(code, 429 | 503),
        ureq::Error::Transport(transport) => {
            transport.to_string().to_ascii_lowercase().contains("timed out")
        }
    }
}

fn request_error(url: &str, error: ureq::Error) -> SourceError {
    match error {
        ureq::Error::Status(code, _) => SourceError::Query(format!("{url} answered {code}")),
        ureq::Error::Transport(transport) => {
            SourceError::Connection(format!("{url}: {transport}"))
        }
    }
}
