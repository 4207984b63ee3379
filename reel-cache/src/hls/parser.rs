//! Hand-written HLS playlist parser.
//!
//! A general-purpose playlist crate doesn't expose the exact
//! attribute-grammar and URI-resolution rules this cache needs tunably
//! enough, so the grammar below is small and deliberate rather than
//! delegated.

use url::Url;

use crate::error::CacheError;

/// A parsed playlist: either a variant manifest or a media (segment) list.
#[derive(Debug, Clone)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

#[derive(Debug, Clone)]
pub struct MasterPlaylist {
    /// Sorted by bandwidth, descending.
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub url: String,
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
}

impl MasterPlaylist {
    /// The highest-bandwidth variant.
    pub fn best_variant(&self) -> Option<&Variant> {
        self.variants.iter().max_by_key(|v| v.bandwidth)
    }

    /// The variant whose bandwidth is closest to `target_bandwidth`.
    pub fn closest_to(&self, target_bandwidth: u64) -> Option<&Variant> {
        self.variants.iter().min_by_key(|v| {
            v.bandwidth.abs_diff(target_bandwidth)
        })
    }
}

#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub segments: Vec<Segment>,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub is_live: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub url: String,
    pub duration: f64,
    pub index: u64,
}

/// Parses a playlist body. `base_url` resolves every relative URL the
/// playlist references.
pub fn parse(body: &str, base_url: &str) -> Result<Playlist, CacheError> {
    let base = Url::parse(base_url)
        .map_err(|e| CacheError::invalid_url(base_url, e.to_string()))?;

    let mut lines = body.lines().map(str::trim);
    let header = lines
        .clone()
        .find(|l| !l.is_empty())
        .ok_or_else(|| CacheError::playlist("empty playlist body"))?;
    if header != "#EXTM3U" {
        return Err(CacheError::playlist(format!(
            "expected #EXTM3U as the first non-empty line, found `{header}`"
        )));
    }

    let lines: Vec<&str> = body.lines().map(str::trim).collect();
    if lines.iter().any(|l| l.starts_with("#EXT-X-STREAM-INF")) {
        parse_master(&lines, &base).map(Playlist::Master)
    } else {
        parse_media(&lines, &base).map(Playlist::Media)
    }
}

fn parse_master(lines: &[&str], base: &Url) -> Result<MasterPlaylist, CacheError> {
    let mut variants = Vec::new();
    let mut index = 0;
    while index < lines.len() {
        let line = lines[index];
        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attrs = parse_attributes(rest);
            let bandwidth = attrs
                .get("BANDWIDTH")
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| CacheError::playlist("#EXT-X-STREAM-INF missing BANDWIDTH"))?;
            let resolution = attrs.get("RESOLUTION").and_then(|v| parse_resolution(v));
            let codecs = attrs.get("CODECS").cloned();

            let uri_line = lines[index + 1..]
                .iter()
                .find(|l| !l.is_empty() && !l.starts_with('#'))
                .ok_or_else(|| CacheError::playlist("#EXT-X-STREAM-INF without a following URI"))?;
            let url = resolve_url(base, uri_line)?;

            variants.push(Variant {
                url,
                bandwidth,
                resolution,
                codecs,
            });
        }
        index += 1;
    }
    variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
    Ok(MasterPlaylist { variants })
}

fn parse_media(lines: &[&str], base: &Url) -> Result<MediaPlaylist, CacheError> {
    let mut segments = Vec::new();
    let mut target_duration = 0u64;
    let mut media_sequence = 0u64;
    let mut is_live = true;
    let mut pending_duration: Option<f64> = None;
    let mut index = 0u64;

    for line in lines {
        if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = rest.trim().parse::<f64>().unwrap_or(0.0).ceil() as u64;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration_str = rest.split(',').next().unwrap_or("0").trim();
            pending_duration = Some(duration_str.parse().unwrap_or(0.0));
        } else if *line == "#EXT-X-ENDLIST" {
            is_live = false;
        } else if !line.is_empty() && !line.starts_with('#') {
            let duration = pending_duration.take().ok_or_else(|| {
                CacheError::playlist(format!("segment URI `{line}` without a preceding #EXTINF"))
            })?;
            let url = resolve_url(base, line)?;
            segments.push(Segment {
                url,
                duration,
                index,
            });
            index += 1;
        }
    }

    Ok(MediaPlaylist {
        segments,
        target_duration,
        media_sequence,
        is_live,
    })
}

/// Parses `KEY=value,KEY="quoted value"` attribute lists.
fn parse_attributes(s: &str) -> std::collections::HashMap<String, String> {
    let mut attrs = std::collections::HashMap::new();
    let mut chars = s.chars().peekable();

    loop {
        // Skip separators.
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while chars
            .peek()
            .is_some_and(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '-')
        {
            key.push(chars.next().unwrap());
        }
        if key.is_empty() {
            break;
        }
        if chars.peek() != Some(&'=') {
            break;
        }
        chars.next(); // consume '='

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while chars.peek().is_some_and(|c| *c != ',') {
                value.push(chars.next().unwrap());
            }
        }
        attrs.insert(key, value);
    }

    attrs
}

fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Absolute URLs pass through; a leading-slash URL combines with the base's
/// scheme and authority; anything else combines with the base's directory.
fn resolve_url(base: &Url, reference: &str) -> Result<String, CacheError> {
    if reference.contains("://") {
        return Url::parse(reference)
            .map(|u| u.to_string())
            .map_err(|e| CacheError::invalid_url(reference, e.to_string()));
    }
    base.join(reference)
        .map(|u| u.to_string())
        .map_err(|e| CacheError::invalid_url(reference, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.42e00a\"\n\
low/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1920x1080\n\
high/index.m3u8\n";

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:10\n\
#EXTINF:5.994,\n\
seg0.ts\n\
#EXTINF:6.006,\n\
/abs/seg1.ts\n\
#EXT-X-ENDLIST\n";

    const LIVE_MEDIA: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n";

    #[test]
    fn master_playlist_variants_sorted_descending_by_bandwidth() {
        let parsed = parse(MASTER, "https://h/master.m3u8").unwrap();
        let Playlist::Master(master) = parsed else {
            panic!("expected master playlist");
        };
        assert_eq!(master.variants.len(), 2);
        assert_eq!(master.variants[0].bandwidth, 2_800_000);
        assert_eq!(master.variants[0].url, "https://h/high/index.m3u8");
        assert_eq!(master.variants[0].resolution, Some((1920, 1080)));
        assert_eq!(master.variants[1].codecs.as_deref(), Some("avc1.42e00a"));
    }

    #[test]
    fn best_variant_picks_highest_bandwidth() {
        let parsed = parse(MASTER, "https://h/master.m3u8").unwrap();
        let Playlist::Master(master) = parsed else {
            panic!("expected master playlist");
        };
        assert_eq!(master.best_variant().unwrap().bandwidth, 2_800_000);
    }

    #[test]
    fn closest_to_picks_minimum_absolute_difference() {
        let parsed = parse(MASTER, "https://h/master.m3u8").unwrap();
        let Playlist::Master(master) = parsed else {
            panic!("expected master playlist");
        };
        assert_eq!(master.closest_to(1_000_000).unwrap().bandwidth, 800_000);
        assert_eq!(master.closest_to(2_000_000).unwrap().bandwidth, 2_800_000);
    }

    #[test]
    fn media_playlist_parses_segments_and_metadata() {
        let parsed = parse(MEDIA, "https://h/vod/index.m3u8").unwrap();
        let Playlist::Media(media) = parsed else {
            panic!("expected media playlist");
        };
        assert_eq!(media.target_duration, 6);
        assert_eq!(media.media_sequence, 10);
        assert!(!media.is_live);
        assert_eq!(media.segments.len(), 2);
        assert_eq!(media.segments[0].url, "https://h/vod/seg0.ts");
        assert_eq!(media.segments[0].index, 0);
        // Leading-slash URL combines with scheme + authority, not the path.
        assert_eq!(media.segments[1].url, "https://h/abs/seg1.ts");
    }

    #[test]
    fn media_playlist_without_endlist_is_live() {
        let parsed = parse(LIVE_MEDIA, "https://h/live/index.m3u8").unwrap();
        let Playlist::Media(media) = parsed else {
            panic!("expected media playlist");
        };
        assert!(media.is_live);
    }

    #[test]
    fn missing_extm3u_header_is_a_format_error() {
        let err = parse("#EXT-X-VERSION:3\n", "https://h/x.m3u8").unwrap_err();
        assert!(matches!(err, CacheError::Playlist { .. }));
    }

    #[test]
    fn blank_lines_before_header_are_tolerated() {
        let body = "\n\n#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-ENDLIST\n";
        assert!(parse(body, "https://h/x.m3u8").is_ok());
    }

    #[test]
    fn absolute_segment_urls_pass_through_unchanged() {
        let body = "#EXTM3U\n#EXTINF:1.0,\nhttps://other-host/seg.ts\n";
        let parsed = parse(body, "https://h/x.m3u8").unwrap();
        let Playlist::Media(media) = parsed else {
            panic!("expected media playlist");
        };
        assert_eq!(media.segments[0].url, "https://other-host/seg.ts");
    }

    #[rstest::rstest]
    #[case("BANDWIDTH=800000", "800000", "")]
    #[case("BANDWIDTH=800000,RESOLUTION=640x360", "800000", "640x360")]
    #[case("RESOLUTION=640x360,BANDWIDTH=800000", "800000", "640x360")]
    #[case("BANDWIDTH=800000,CODECS=\"avc1.42e00a,mp4a.40.2\"", "800000", "")]
    fn attribute_parsing_is_order_and_quoting_insensitive(
        #[case] attrs: &str,
        #[case] expected_bandwidth: &str,
        #[case] expected_resolution: &str,
    ) {
        let body = format!("#EXTM3U\n#EXT-X-STREAM-INF:{attrs}\nvariant.m3u8\n");
        let Playlist::Master(master) = parse(&body, "https://h/master.m3u8").unwrap() else {
            panic!("expected master playlist");
        };
        let variant = &master.variants[0];
        assert_eq!(variant.bandwidth.to_string(), expected_bandwidth);
        if expected_resolution.is_empty() {
            assert_eq!(variant.resolution, None);
        } else {
            assert_eq!(variant.resolution, parse_resolution(expected_resolution));
        }
    }

    #[rstest::rstest]
    #[case("seg.ts", "https://h/dir/sub/seg.ts")]
    #[case("/abs/seg.ts", "https://h/abs/seg.ts")]
    #[case("https://other/seg.ts", "https://other/seg.ts")]
    #[case("../seg.ts", "https://h/dir/seg.ts")]
    fn url_resolution_follows_the_three_relative_forms(#[case] reference: &str, #[case] expected: &str) {
        let base = Url::parse("https://h/dir/sub/index.m3u8").unwrap();
        assert_eq!(resolve_url(&base, reference).unwrap(), expected);
    }
}
