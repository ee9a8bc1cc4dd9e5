use super::{
    artwork::RawArtwork,
    track::{DeviceAvailability, MetadataField, TrackMetadata},
};

/// Uniform event shape every source adapter produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    ArtworkReceived(RawArtwork),
    MetadataChanged(TrackMetadata),
    AvailabilityChanged(DeviceAvailability),
    SourceError(String),
}

/// Transitions the notifier may forward to the automation API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    ArtworkChanged,
    TitleChanged(Option<String>),
    ArtistChanged(Option<String>),
    AlbumChanged(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ArtworkChanged,
    TitleChanged,
    ArtistChanged,
    AlbumChanged,
}

impl NotifyEvent {
    pub fn field_changed(field: MetadataField, value: Option<String>) -> Self {
        match field {
            MetadataField::Title => Self::TitleChanged(value),
            MetadataField::Artist => Self::ArtistChanged(value),
            MetadataField::Album => Self::AlbumChanged(value),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::ArtworkChanged => EventKind::ArtworkChanged,
            Self::TitleChanged(_) => EventKind::TitleChanged,
            Self::ArtistChanged(_) => EventKind::ArtistChanged,
            Self::AlbumChanged(_) => EventKind::AlbumChanged,
        }
    }

    /// Argument passed to the remote action.
    ///
    /// Field events always carry one string; a field that became absent is
    /// sent as an empty string.
    pub fn argument(&self) -> Option<String> {
        match self {
            Self::ArtworkChanged => None,
            Self::TitleChanged(value) | Self::ArtistChanged(value) | Self::AlbumChanged(value) => {
                Some(value.clone().unwrap_or_default())
            }
        }
    }
}
