/// What the receiver reports as currently playing.
///
/// A new value always replaces the previous one as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl TrackMetadata {
    pub fn new(title: Option<&str>, artist: Option<&str>, album: Option<&str>) -> Self {
        Self {
            title: title.map(str::to_string),
            artist: artist.map(str::to_string),
            album: album.map(str::to_string),
        }
    }

    pub fn field(&self, field: MetadataField) -> Option<&str> {
        match field {
            MetadataField::Title => self.title.as_deref(),
            MetadataField::Artist => self.artist.as_deref(),
            MetadataField::Album => self.album.as_deref(),
        }
    }

    pub fn set_field(&mut self, field: MetadataField, value: Option<String>) {
        match field {
            MetadataField::Title => self.title = value,
            MetadataField::Artist => self.artist = value,
            MetadataField::Album => self.album = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    Title,
    Artist,
    Album,
}

impl MetadataField {
    pub const ALL: [MetadataField; 3] = [Self::Title, Self::Artist, Self::Album];
}

/// Whether the audio device is reachable, as far as the source can tell.
///
/// Only sources with an explicit availability signal ever leave `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceAvailability {
    #[default]
    Unknown,
    Online,
    Offline,
}
