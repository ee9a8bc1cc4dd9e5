//! Message-bus source: artwork and metadata published on MQTT sub-topics.

use std::{thread, time::Duration};

use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};

use crate::{
    config::MqttConfig,
    domain::{
        artwork::RawArtwork,
        event::SourceEvent,
        track::{DeviceAvailability, MetadataField, TrackMetadata},
    },
    source::backoff::Backoff,
};

/// What a single publish means for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Artwork,
    Field(MetadataField),
    Availability,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct TopicMap {
    prefix: String,
    cover: String,
    title: String,
    artist: String,
    album: String,
    availability: Option<String>,
    payload_available: String,
    payload_not_available: String,
}

impl TopicMap {
    pub fn from_config(config: &MqttConfig) -> Self {
        let prefix = config.topic_prefix.trim_end_matches('/').to_string();
        let sub = |name: &str| format!("{prefix}/{}", name.trim_matches('/'));

        Self {
            cover: sub(&config.cover_topic),
            title: sub(&config.title_topic),
            artist: sub(&config.artist_topic),
            album: sub(&config.album_topic),
            availability: config.availability_topic.clone(),
            payload_available: config.payload_available.clone(),
            payload_not_available: config.payload_not_available.clone(),
            prefix,
        }
    }

    /// Topic filters to subscribe to after every (re)connect.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![format!("{}/#", self.prefix)];
        if let Some(availability) = &self.availability {
            topics.push(availability.clone());
        }
        topics
    }

    pub fn route(&self, topic: &str) -> Route {
        if self.availability.as_deref() == Some(topic) {
            Route::Availability
        } else if topic == self.cover {
            Route::Artwork
        } else if topic == self.title {
            Route::Field(MetadataField::Title)
        } else if topic == self.artist {
            Route::Field(MetadataField::Artist)
        } else if topic == self.album {
            Route::Field(MetadataField::Album)
        } else {
            Route::Ignored
        }
    }

    fn availability(&self, payload: &str) -> Option<DeviceAvailability> {
        if payload == self.payload_available {
            Some(DeviceAvailability::Online)
        } else if payload == self.payload_not_available {
            Some(DeviceAvailability::Offline)
        } else {
            None
        }
    }
}

/// Turns publishes into events. Keeps a running view of the metadata because
/// every field arrives on its own topic.
#[derive(Debug, Clone)]
pub struct BusFeed {
    topics: TopicMap,
    metadata: TrackMetadata,
}

impl BusFeed {
    pub fn new(topics: TopicMap) -> Self {
        Self {
            topics,
            metadata: TrackMetadata::default(),
        }
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    pub fn handle_publish(&mut self, topic: &str, payload: &[u8]) -> Option<SourceEvent> {
        match self.topics.route(topic) {
            Route::Artwork => Some(SourceEvent::ArtworkReceived(RawArtwork::new(
                payload.to_vec(),
            ))),
            Route::Field(field) => {
                let text = String::from_utf8_lossy(payload).trim().to_string();
                let value = (!text.is_empty()).then_some(text);
                self.metadata.set_field(field, value);
                Some(SourceEvent::MetadataChanged(self.metadata.clone()))
            }
            Route::Availability => {
                let text = String::from_utf8_lossy(payload);
                let availability = self.topics.availability(text.trim());
                if availability.is_none() {
                    debug!("ignoring unknown availability payload '{text}'");
                }
                availability.map(SourceEvent::AvailabilityChanged)
            }
            Route::Ignored => {
                debug!("ignoring publish on {topic}");
                None
            }
        }
    }
}

/// Persistent MQTT subscription.
///
/// `rumqttc` reconnects on the next poll after an error; this adds backoff
/// between attempts and re-subscribes after every successful connect.
pub struct BusSubscriber {
    client: Client,
    connection: Connection,
    options: MqttOptions,
    feed: BusFeed,
    backoff: Backoff,
    pending_delay: Option<Duration>,
}

impl BusSubscriber {
    pub fn new(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_max_packet_size(config.max_payload_bytes, config.max_payload_bytes);
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, connection) = Client::new(options.clone(), 10);
        info!(
            "connecting to MQTT broker {}:{} as '{}'",
            config.host, config.port, config.client_id
        );

        Self {
            client,
            connection,
            options,
            feed: BusFeed::new(TopicMap::from_config(config)),
            backoff: Backoff::new(
                Duration::from_millis(500),
                Duration::from_secs(config.reconnect_max_secs.max(1)),
            ),
            pending_delay: None,
        }
    }

    fn subscribe(&mut self) {
        for topic in self.feed.topics().subscriptions() {
            match self.client.try_subscribe(&topic, QoS::AtMostOnce) {
                Ok(()) => info!("subscribed to {topic}"),
                Err(e) => warn!("failed to subscribe to {topic}: {e}"),
            }
        }
    }

    fn connection_failed(&mut self, reason: String) -> SourceEvent {
        let delay = self.backoff.next_delay();
        warn!(
            "{reason} (attempt {}), retrying in {delay:?}",
            self.backoff.attempts()
        );
        self.pending_delay = Some(delay);
        SourceEvent::SourceError(reason)
    }
}

impl Iterator for BusSubscriber {
    type Item = SourceEvent;

    fn next(&mut self) -> Option<SourceEvent> {
        if let Some(delay) = self.pending_delay.take() {
            thread::sleep(delay);
        }

        loop {
            match self.connection.recv() {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    info!("connected to MQTT broker");
                    self.backoff.reset();
                    self.subscribe();
                }
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    if let Some(event) = self.feed.handle_publish(&publish.topic, &publish.payload)
                    {
                        return Some(event);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Some(self.connection_failed(format!("MQTT connection error: {e}")));
                }
                Err(_) => {
                    // The event loop is gone; start a fresh client.
                    let (client, connection) = Client::new(self.options.clone(), 10);
                    self.client = client;
                    self.connection = connection;
                    return Some(self.connection_failed("MQTT event loop stopped".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        let cfg: crate::config::Config = toml::from_str(
            r#"
[image]
width = 1
height = 1
default_jpeg = "a"
default_png = "b"

[http]
bind_addr = "0.0.0.0"
port = 1

[mqtt]
host = "localhost"
topic_prefix = "receiver/now_playing/"
availability_topic = "receiver/status"
payload_available = "up"
payload_not_available = "down"
"#,
        )
        .unwrap();
        cfg.mqtt.unwrap()
    }

    fn feed() -> BusFeed {
        BusFeed::new(TopicMap::from_config(&config()))
    }

    #[test]
    fn routes_known_sub_topics() {
        let topics = TopicMap::from_config(&config());

        assert_eq!(topics.route("receiver/now_playing/cover"), Route::Artwork);
        assert_eq!(
            topics.route("receiver/now_playing/artist"),
            Route::Field(MetadataField::Artist)
        );
        assert_eq!(topics.route("receiver/status"), Route::Availability);
        assert_eq!(topics.route("receiver/now_playing/volume"), Route::Ignored);
        assert_eq!(topics.route("elsewhere/cover"), Route::Ignored);
    }

    #[test]
    fn subscribes_to_prefix_wildcard_and_availability() {
        let topics = TopicMap::from_config(&config());

        assert_eq!(
            topics.subscriptions(),
            vec![
                "receiver/now_playing/#".to_string(),
                "receiver/status".to_string()
            ]
        );
    }

    #[test]
    fn cover_payload_becomes_raw_artwork() {
        let mut feed = feed();

        let event = feed.handle_publish("receiver/now_playing/cover", &[0xff, 0xd8, 1, 2]);

        assert_eq!(
            event,
            Some(SourceEvent::ArtworkReceived(RawArtwork::new(vec![
                0xff, 0xd8, 1, 2
            ])))
        );
    }

    #[test]
    fn field_updates_accumulate_into_full_metadata() {
        let mut feed = feed();

        feed.handle_publish("receiver/now_playing/title", b"Song");
        let event = feed.handle_publish("receiver/now_playing/artist", b" Band \n");

        assert_eq!(
            event,
            Some(SourceEvent::MetadataChanged(TrackMetadata::new(
                Some("Song"),
                Some("Band"),
                None
            )))
        );
    }

    #[test]
    fn empty_field_payload_clears_the_field() {
        let mut feed = feed();
        feed.handle_publish("receiver/now_playing/album", b"Record");

        let event = feed.handle_publish("receiver/now_playing/album", b"");

        assert_eq!(
            event,
            Some(SourceEvent::MetadataChanged(TrackMetadata::default()))
        );
    }

    #[test]
    fn availability_payloads_are_configurable() {
        let mut feed = feed();

        assert_eq!(
            feed.handle_publish("receiver/status", b"down"),
            Some(SourceEvent::AvailabilityChanged(DeviceAvailability::Offline))
        );
        assert_eq!(
            feed.handle_publish("receiver/status", b"up"),
            Some(SourceEvent::AvailabilityChanged(DeviceAvailability::Online))
        );
        assert_eq!(feed.handle_publish("receiver/status", b"online"), None);
    }
}
