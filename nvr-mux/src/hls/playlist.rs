use {
    chrono::{DateTime, SecondsFormat, Utc},
    std::collections::{HashSet, VecDeque},
    std::fmt::Write,
};

/// Segment metadata for M3U8 generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment sequence number
    pub sequence: u64,
    /// Segment duration in milliseconds
    pub duration: i64,
    /// TS filename relative to the playlist (e.g. `segment_12.ts`)
    pub ts_name: String,
    /// Whether this is a discontinuity point
    pub discontinuity: bool,
    /// Wallclock time of the first frame
    pub program_date_time: DateTime<Utc>,
}

/// Sliding-window live playlist.
#[derive(Debug, Clone)]
pub struct Playlist {
    pub segments: VecDeque<SegmentInfo>,
    pub list_size: usize,
    /// Configured segment length in milliseconds; floor for `#EXT-X-TARGETDURATION`.
    pub target_duration: i64,
    pub is_ended: bool,
}

impl Playlist {
    #[must_use]
    pub fn new(list_size: usize, target_duration: i64) -> Self {
        Self {
            segments: VecDeque::with_capacity(list_size + 1),
            list_size: list_size.max(1),
            target_duration,
            is_ended: false,
        }
    }

    /// Append a segment, returning the one that slid out of the window.
    pub fn push(&mut self, segment: SegmentInfo) -> Option<SegmentInfo> {
        self.segments.push_back(segment);
        if self.segments.len() > self.list_size {
            self.segments.pop_front()
        } else {
            None
        }
    }

    #[must_use]
    pub fn segment_names(&self) -> HashSet<&str> {
        self.segments.iter().map(|s| s.ts_name.as_str()).collect()
    }

    /// Generate M3U8 content with a custom TS URL generator.
    ///
    /// # Example
    /// ```ignore
    /// let m3u8 = playlist.generate_m3u8(|ts_name| format!("/hls/{stream}/{ts_name}"));
    /// ```
    pub fn generate_m3u8<F>(&self, mut gen_ts_url: F) -> String
    where
        F: FnMut(&str) -> String,
    {
        let mut m3u8_content = String::new();

        m3u8_content.push_str("#EXTM3U\n");
        m3u8_content.push_str("#EXT-X-VERSION:3\n");

        // Target duration: longest segment in whole seconds, rounded up
        let max_duration_sec = self
            .segments
            .iter()
            .map(|s| s.duration)
            .chain(std::iter::once(self.target_duration))
            .map(|ms| (ms + 999) / 1000)
            .max()
            .unwrap_or(1)
            .max(1);
        let _ = writeln!(m3u8_content, "#EXT-X-TARGETDURATION:{max_duration_sec}");

        let first_seq = self.segments.front().map_or(0, |s| s.sequence);
        let _ = writeln!(m3u8_content, "#EXT-X-MEDIA-SEQUENCE:{first_seq}");

        for segment in &self.segments {
            if segment.discontinuity {
                m3u8_content.push_str("#EXT-X-DISCONTINUITY\n");
            }
            let _ = writeln!(
                m3u8_content,
                "#EXT-X-PROGRAM-DATE-TIME:{}",
                segment
                    .program_date_time
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
            );

            let duration_sec = segment.duration as f64 / 1000.0;
            let _ = writeln!(m3u8_content, "#EXTINF:{duration_sec:.3},");
            let segment_url = gen_ts_url(&segment.ts_name);
            let _ = writeln!(m3u8_content, "{segment_url}");
        }

        if self.is_ended {
            m3u8_content.push_str("#EXT-X-ENDLIST\n");
        }

        m3u8_content
    }
}

/// File names of the media segments a playlist references.
#[must_use]
pub fn referenced_segments(m3u8: &str) -> HashSet<String> {
    m3u8.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let path = line.split(['?', '#']).next().unwrap_or(line);
            path.rsplit('/').next().unwrap_or(path).to_string()
        })
        .collect()
}
