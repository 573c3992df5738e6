//! Parsing of user-supplied provider references.
//!
//! Accepts share URLs (`open.spotify.com/track/<id>`), canonical URIs
//! (`spotify:track:<id>`), and bare 22-character track ids.

use url::Url;

/// The entity kind a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Track,
    Playlist,
    Album,
    Artist,
    Episode,
    Show,
}

impl ResourceKind {
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "track" => Some(Self::Track),
            "playlist" => Some(Self::Playlist),
            "album" => Some(Self::Album),
            "artist" => Some(Self::Artist),
            "episode" => Some(Self::Episode),
            "show" => Some(Self::Show),
            _ => None,
        }
    }

    /// The URI segment name for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Playlist => "playlist",
            Self::Album => "album",
            Self::Artist => "artist",
            Self::Episode => "episode",
            Self::Show => "show",
        }
    }
}

/// A successfully parsed provider reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResource {
    pub kind: ResourceKind,
    pub id: String,
    /// Canonical `spotify:<kind>:<id>` form.
    pub uri: String,
}

impl ParsedResource {
    fn new(kind: ResourceKind, id: &str) -> Option<Self> {
        if !is_valid_id(id) {
            return None;
        }
        Some(Self {
            kind,
            id: id.to_string(),
            uri: format!("spotify:{}:{}", kind.as_str(), id),
        })
    }
}

/// Provider ids are base62.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Track ids are exactly 22 base62 characters.
fn is_bare_track_id(input: &str) -> bool {
    input.len() == 22 && input.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Parses a share URL, URI, or bare id into a typed resource reference.
///
/// Returns `None` for anything that is not recognizably a provider
/// reference; the caller decides which kinds are admissible.
#[must_use]
pub fn parse_resource(input: &str) -> Option<ParsedResource> {
    let input = input.trim();

    if let Some(rest) = input.strip_prefix("spotify:") {
        let mut parts = rest.split(':');
        let kind = ResourceKind::from_segment(parts.next()?)?;
        let id = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        return ParsedResource::new(kind, id);
    }

    if input.contains("spotify.com") {
        return parse_share_url(input);
    }

    if is_bare_track_id(input) {
        return ParsedResource::new(ResourceKind::Track, input);
    }

    None
}

fn parse_share_url(input: &str) -> Option<ParsedResource> {
    let normalized = if input.starts_with("http://") || input.starts_with("https://") {
        input.to_string()
    } else {
        format!("https://{input}")
    };

    let url = Url::parse(&normalized).ok()?;
    url.host_str().filter(|h| h.ends_with("spotify.com"))?;

    // Share links may carry a locale segment: open.spotify.com/intl-de/track/<id>
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let mut kind_segment = segments.next()?;
    if kind_segment.starts_with("intl-") {
        kind_segment = segments.next()?;
    }

    let kind = ResourceKind::from_segment(kind_segment)?;
    let id = segments.next()?;

    ParsedResource::new(kind, id)
}
