//! HLS playlist model (C1): master/media playlist parsing, variant
//! selection, and the live-start cursor policy, built on `m3u8-rs` and
//! `url` the way `mesio`'s `PlaylistEngine` does, but standing alone from
//! its cache/proxy machinery.

use std::time::Duration;

use m3u8_rs::{MediaPlaylist as M3uMediaPlaylist, Playlist as M3uPlaylist};
use tracing::{debug, warn};
use url::Url;

use crate::config::HlsVariantSelectionPolicy;
use crate::error::HlsError;

/// One segment of a media playlist, with its URI resolved to absolute form.
#[derive(Debug, Clone)]
pub struct MediaSegment {
    pub uri: String,
    pub duration_ns: i64,
    pub discontinuity: bool,
    pub media_sequence: u64,
}

/// A single rendition: its own URI, nominal bandwidth, and (once loaded)
/// its ordered segment list.
#[derive(Debug, Clone)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub segments: Vec<MediaSegment>,
    pub target_duration_secs: u64,
    pub media_sequence_base: u64,
    pub end_list: bool,
}

impl Variant {
    /// Total duration, only defined for a complete (`end_list`) playlist.
    pub fn duration(&self) -> Option<Duration> {
        if !self.end_list {
            return None;
        }
        let total_ns: i64 = self.segments.iter().map(|s| s.duration_ns).sum();
        Some(Duration::from_nanos(total_ns.max(0) as u64))
    }

    pub fn is_live(&self) -> bool {
        !self.end_list
    }

    /// Highest media sequence number this variant has seen + 1, i.e. the
    /// sequence the next appended segment must carry.
    fn next_expected_sequence(&self) -> u64 {
        self.media_sequence_base + self.segments.len() as u64
    }
}

/// Either a master playlist (a ladder of not-yet-fetched variants) or a
/// single already-loaded media playlist (when the given URI names one
/// directly, with no variant indirection).
#[derive(Debug, Clone)]
pub enum Playlist {
    Master(Vec<Variant>),
    Media(Variant),
}

/// Parses playlist text fetched from `playlist_uri`. Rejects anything that
/// isn't valid UTF-8 or doesn't start with `#EXTM3U` (guards against
/// swallowing a 404 HTML body as if it were a playlist).
pub fn parse(text: &[u8], playlist_uri: &Url) -> Result<Playlist, HlsError> {
    let text_str = std::str::from_utf8(text).map_err(|e| {
        HlsError::invalid_playlist(playlist_uri.as_str(), format!("not valid UTF-8: {e}"))
    })?;
    if !text_str.trim_start().starts_with("#EXTM3U") {
        return Err(HlsError::invalid_playlist(
            playlist_uri.as_str(),
            "missing #EXTM3U leader",
        ));
    }

    match m3u8_rs::parse_playlist_res(text) {
        Ok(M3uPlaylist::MasterPlaylist(master)) => {
            if master.variants.is_empty() {
                return Err(HlsError::invalid_playlist(
                    playlist_uri.as_str(),
                    "master playlist has no variants",
                ));
            }
            let mut variants: Vec<Variant> = master
                .variants
                .iter()
                .map(|v| {
                    let uri = resolve_uri(playlist_uri, &v.uri)?;
                    Ok(Variant {
                        uri,
                        bandwidth: v.bandwidth,
                        codecs: v.codecs.clone(),
                        segments: Vec::new(),
                        target_duration_secs: 0,
                        media_sequence_base: 0,
                        end_list: false,
                    })
                })
                .collect::<Result<_, HlsError>>()?;
            variants.sort_by_key(|v| v.bandwidth);
            Ok(Playlist::Master(variants))
        }
        Ok(M3uPlaylist::MediaPlaylist(media)) => {
            Ok(Playlist::Media(to_variant(playlist_uri, &media)?))
        }
        Err(e) => Err(HlsError::invalid_playlist(
            playlist_uri.as_str(),
            format!("{e}"),
        )),
    }
}

fn resolve_uri(base: &Url, relative: &str) -> Result<String, HlsError> {
    base.join(relative)
        .map(|u| u.to_string())
        .map_err(|e| HlsError::invalid_playlist(base.as_str(), format!("bad URI {relative}: {e}")))
}

fn to_variant(playlist_uri: &Url, media: &M3uMediaPlaylist) -> Result<Variant, HlsError> {
    let mut segments = Vec::with_capacity(media.segments.len());
    for (idx, seg) in media.segments.iter().enumerate() {
        if seg.uri.trim().is_empty() {
            warn!(
                msn = media.media_sequence + idx as u64,
                "skipping segment with empty URI"
            );
            continue;
        }
        let uri = resolve_uri(playlist_uri, &seg.uri)?;
        let duration_ns = (seg.duration as f64 * 1_000_000_000.0).round() as i64;
        segments.push(MediaSegment {
            uri,
            duration_ns,
            discontinuity: seg.discontinuity,
            media_sequence: media.media_sequence + idx as u64,
        });
    }
    Ok(Variant {
        uri: playlist_uri.to_string(),
        bandwidth: 0,
        codecs: None,
        segments,
        target_duration_secs: media.target_duration,
        media_sequence_base: media.media_sequence,
        end_list: media.end_list,
    })
}

/// Picks a variant from a master ladder per the configured policy. The
/// ladder is sorted ascending by bandwidth by [`parse`].
pub fn select_variant<'a>(
    variants: &'a [Variant],
    policy: &HlsVariantSelectionPolicy,
) -> Result<&'a Variant, HlsError> {
    if variants.is_empty() {
        return Err(HlsError::invalid_playlist("<master>", "no variants"));
    }
    let pick = match policy {
        HlsVariantSelectionPolicy::HighestBitrate => variants.iter().max_by_key(|v| v.bandwidth),
        HlsVariantSelectionPolicy::LowestBitrate => variants.iter().min_by_key(|v| v.bandwidth),
        HlsVariantSelectionPolicy::ClosestToBitrate(target) => variants
            .iter()
            .min_by_key(|v| (*target as i64 - v.bandwidth as i64).abs()),
        HlsVariantSelectionPolicy::AudioOnly => variants
            .iter()
            .find(|v| v.codecs.as_ref().is_some_and(|c| c.contains("mp4a") && !c.contains("avc"))),
        HlsVariantSelectionPolicy::VideoOnly => variants
            .iter()
            .find(|v| v.codecs.as_ref().is_some_and(|c| c.contains("avc"))),
        HlsVariantSelectionPolicy::MatchingResolution { .. } => variants.first(),
        HlsVariantSelectionPolicy::Custom(name) => {
            warn!(policy = %name, "custom variant policy not implemented, selecting first variant");
            variants.first()
        }
    };
    pick.ok_or_else(|| HlsError::invalid_playlist("<master>", "no variant matched policy"))
}

/// Per-client playback position against a single [`Variant`].
#[derive(Debug, Clone)]
pub struct ClientState {
    pub variant: Variant,
    cursor: u64,
    pub update_failed_count: u32,
    pending_switch_discontinuity: bool,
}

/// Result of [`next_segment`].
#[derive(Debug, Clone)]
pub enum NextSegment {
    Segment {
        uri: String,
        duration_ns: i64,
        discontinuous: bool,
    },
    EndOfPlaylist,
}

impl ClientState {
    /// Starts a VOD variant at its first segment.
    pub fn start_vod(variant: Variant) -> Self {
        let cursor = variant.media_sequence_base;
        Self {
            variant,
            cursor,
            update_failed_count: 0,
            pending_switch_discontinuity: false,
        }
    }

    /// Starts a live variant per §4.1's live-start policy: `len(segments) -
    /// fragments_cache`, clamped to be no earlier than the first segment.
    pub fn start_live(variant: Variant, fragments_cache: usize) -> Self {
        let len = variant.segments.len() as i64;
        let back = len - fragments_cache as i64;
        let offset = back.max(0) as u64;
        let cursor = variant.media_sequence_base + offset;
        Self {
            variant,
            cursor,
            update_failed_count: 0,
            pending_switch_discontinuity: false,
        }
    }

    /// Re-points this client at a newly selected variant; the next emitted
    /// segment is marked discontinuous regardless of its own tag.
    pub fn switch_variant(&mut self, variant: Variant) {
        self.variant = variant;
        self.cursor = self.variant.media_sequence_base;
        self.pending_switch_discontinuity = true;
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// Merges newly fetched playlist text into `client`'s variant: segments
/// with a media sequence the client hasn't seen are appended;
/// `target_duration`/`end_list` are replaced wholesale. Returns `true` if
/// anything changed.
pub fn update(client: &mut ClientState, text: &[u8], playlist_uri: &Url) -> Result<bool, HlsError> {
    let parsed = parse(text, playlist_uri)?;
    let new_variant = match parsed {
        Playlist::Media(v) => v,
        Playlist::Master(_) => {
            return Err(HlsError::invalid_playlist(
                playlist_uri.as_str(),
                "expected media playlist, got master",
            ));
        }
    };

    let next_expected = client.variant.next_expected_sequence();
    let mut changed = false;
    for seg in &new_variant.segments {
        if seg.media_sequence >= next_expected {
            client.variant.segments.push(seg.clone());
            changed = true;
        }
    }
    if client.variant.target_duration_secs != new_variant.target_duration_secs {
        client.variant.target_duration_secs = new_variant.target_duration_secs;
        changed = true;
    }
    if client.variant.end_list != new_variant.end_list {
        client.variant.end_list = new_variant.end_list;
        changed = true;
    }
    debug!(
        uri = %playlist_uri,
        appended = changed,
        segments = client.variant.segments.len(),
        "playlist refresh merged"
    );
    Ok(changed)
}

/// Advances `client`'s cursor and returns the next segment to fetch, or
/// [`NextSegment::EndOfPlaylist`] if the cursor has caught up.
pub fn next_segment(client: &mut ClientState) -> NextSegment {
    let Some(idx) = client.cursor.checked_sub(client.variant.media_sequence_base) else {
        return NextSegment::EndOfPlaylist;
    };
    let Some(seg) = client.variant.segments.get(idx as usize) else {
        return NextSegment::EndOfPlaylist;
    };
    let discontinuous = seg.discontinuity || client.pending_switch_discontinuity;
    client.pending_switch_discontinuity = false;
    client.cursor += 1;
    NextSegment::Segment {
        uri: seg.uri.clone(),
        duration_ns: seg.duration_ns,
        discontinuous,
    }
}
