//! Hunk header parsing and formatting.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

fn lenient_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@\s+-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s+@@(.*)$")
            .unwrap_or_else(|e| panic!("invalid hunk header regex: {e}"))
    })
}

fn strict_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@(.*)$")
            .unwrap_or_else(|e| panic!("invalid hunk header regex: {e}"))
    })
}

/// A parsed `@@ -a,b +c,d @@ section` line.
///
/// Omitted counts are 1, matching git's own reading of the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkHeader {
    pub old_start: u64,
    pub old_count: u64,
    pub new_start: u64,
    pub new_count: u64,
    /// Everything after the closing `@@`, including the leading space.
    pub section: String,
}

impl HunkHeader {
    /// Parse a header, tolerating runs of whitespace between fields.
    pub fn parse(line: &str) -> Option<Self> {
        Self::from_captures(lenient_header_re(), line)
    }

    /// Parse a header with git's exact single-space layout.
    pub fn parse_strict(line: &str) -> Option<Self> {
        Self::from_captures(strict_header_re(), line)
    }

    fn from_captures(re: &Regex, line: &str) -> Option<Self> {
        let caps = re.captures(line)?;
        let num = |i: usize| -> Option<u64> {
            match caps.get(i) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(1),
            }
        };
        Some(Self {
            old_start: num(1)?,
            old_count: num(2)?,
            new_start: num(3)?,
            new_count: num(4)?,
            section: caps.get(5).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
    }

    /// Same header with the given line counts.
    #[must_use]
    pub fn with_counts(&self, old_count: u64, new_count: u64) -> Self {
        Self {
            old_count,
            new_count,
            ..self.clone()
        }
    }
}

impl fmt::Display for HunkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@@ -{}{} +{}{} @@{}",
            self.old_start,
            format_count(self.old_count),
            self.new_start,
            format_count(self.new_count),
            self.section
        )
    }
}

/// Git omits the count when it is exactly 1.
fn format_count(n: u64) -> String {
    if n == 1 {
        String::new()
    } else {
        format!(",{n}")
    }
}

/// How a single line inside a hunk body contributes to the counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLine {
    Context,
    Removed,
    Added,
    /// `\ No newline at end of file`
    Marker,
    Blank,
    /// A non-empty line missing its one-character prefix.
    Unprefixed,
}

impl BodyLine {
    pub fn classify(line: &str) -> Self {
        match line.as_bytes().first() {
            None => Self::Blank,
            Some(b' ') => Self::Context,
            Some(b'-') => Self::Removed,
            Some(b'+') => Self::Added,
            Some(b'\\') => Self::Marker,
            Some(_) => Self::Unprefixed,
        }
    }

    /// (old, new) contribution of this line.
    pub fn counts(self) -> (u64, u64) {
        match self {
            Self::Context | Self::Unprefixed | Self::Blank => (1, 1),
            Self::Removed => (1, 0),
            Self::Added => (0, 1),
            Self::Marker => (0, 0),
        }
    }
}

/// True for lines that may legitimately appear between file headers and hunks.
pub fn is_diff_header_line(line: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "diff --git ",
        "index ",
        "--- ",
        "+++ ",
        "new file mode ",
        "deleted file mode ",
        "similarity index ",
        "dissimilarity index ",
        "rename from ",
        "rename to ",
        "copy from ",
        "copy to ",
        "old mode ",
        "new mode ",
        "Binary files ",
        "GIT binary patch",
        "literal ",
        "delta ",
        "@@ ",
    ];
    PREFIXES.iter().any(|p| line.starts_with(p))
}
