// Scripted Gateway - Content Negotiation
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Media types for file resources and the Accept header parser.

use serde::{Deserialize, Serialize};

pub const MEDIA_RAW: &str = "application/vnd.scripted.raw";
pub const MEDIA_DIRECTORY: &str = "application/vnd.scripted.directory";
pub const MEDIA_LINT: &str = "application/vnd.scripted.lint";
pub const MEDIA_DEPENDENCIES: &str = "application/vnd.scripted.dependencies";
pub const MEDIA_COMMANDS: &str = "application/vnd.scripted.commands";
pub const MEDIA_CONSOLE: &str = "application/vnd.scripted.console";

/// Representation kinds a file resource can take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Raw,
    Directory,
    Lint,
    Dependencies,
}

impl ContentKind {
    /// File representations in selection priority
    pub const FILE_PRIORITY: [ContentKind; 3] =
        [ContentKind::Raw, ContentKind::Lint, ContentKind::Dependencies];

    pub fn media_type(self) -> &'static str {
        match self {
            ContentKind::Raw => MEDIA_RAW,
            ContentKind::Directory => MEDIA_DIRECTORY,
            ContentKind::Lint => MEDIA_LINT,
            ContentKind::Dependencies => MEDIA_DEPENDENCIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct MediaRange {
    kind: String,
    subtype: String,
    q: f32,
}

impl MediaRange {
    fn matches(&self, media_type: &str) -> bool {
        let (kind, subtype) = media_type.split_once('/').unwrap_or((media_type, ""));
        (self.kind == "*" || self.kind == kind) && (self.subtype == "*" || self.subtype == subtype)
    }
}

/// Parsed Accept header
#[derive(Debug, Clone, PartialEq)]
pub struct Accept {
    ranges: Vec<MediaRange>,
}

impl Accept {
    /// Accepts everything. Used when the header is absent.
    pub fn any() -> Self {
        Self {
            ranges: vec![MediaRange { kind: "*".into(), subtype: "*".into(), q: 1.0 }],
        }
    }

    /// Parse `type/subtype;q=0.5, ...`. Unparseable ranges are ignored;
    /// a missing or blank header accepts everything.
    pub fn parse(header: Option<&str>) -> Self {
        let header = match header.map(str::trim) {
            Some(h) if !h.is_empty() => h,
            _ => return Self::any(),
        };

        let mut ranges = Vec::new();
        for item in header.split(',') {
            let mut params = item.split(';');
            let media = params.next().unwrap_or("").trim().to_ascii_lowercase();
            let Some((kind, subtype)) = media.split_once('/') else { continue };
            if kind.is_empty() || subtype.is_empty() {
                continue;
            }

            let mut q = 1.0f32;
            for param in params {
                if let Some((name, value)) = param.split_once('=') {
                    if name.trim().eq_ignore_ascii_case("q") {
                        q = value.trim().parse().unwrap_or(1.0f32).clamp(0.0, 1.0);
                    }
                }
            }
            ranges.push(MediaRange { kind: kind.to_string(), subtype: subtype.to_string(), q });
        }
        Self { ranges }
    }

    /// True when some range with q > 0 matches. An explicit q=0 on the
    /// most specific matching range wins over wildcards.
    pub fn accepts(&self, media_type: &str) -> bool {
        let mut best: Option<(u8, f32)> = None;
        for range in self.ranges.iter().filter(|r| r.matches(media_type)) {
            let specificity = match (range.kind.as_str(), range.subtype.as_str()) {
                ("*", _) => 0,
                (_, "*") => 1,
                _ => 2,
            };
            match best {
                Some((s, _)) if s > specificity => {}
                Some((s, q)) if s == specificity && q >= range.q => {}
                _ => best = Some((specificity, range.q)),
            }
        }
        matches!(best, Some((_, q)) if q > 0.0)
    }

    /// First acceptable file representation, in raw > lint > dependencies order
    pub fn select_file_kind(&self) -> Option<ContentKind> {
        ContentKind::FILE_PRIORITY
            .into_iter()
            .find(|kind| self.accepts(kind.media_type()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
