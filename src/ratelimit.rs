/// Limit detection: classify output fragments as usage/rate limit signals.
///
/// Covers explicit reset phrasing (`limit reset at`, `usage limit`), generic
/// throttling (`rate limit`, `too many requests`, `429`, `503`), transient
/// unavailability (`try again later`), and Chinese equivalents. Matching is
/// case-insensitive and works on partial lines.
use regex::Regex;
use std::sync::LazyLock;

/// Compiled regex patterns for limit detection.
static LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Reset phrasing
        Regex::new(r"(?i)limit\s+(?:will\s+)?resets?\s+(?:at|in)").unwrap(),
        Regex::new(r"(?i)usage\s+limit").unwrap(),
        Regex::new(r"(?i)hit\s+your\s+limit").unwrap(),
        Regex::new(r"(?i)limit\s+reached").unwrap(),
        Regex::new(r"(?i)resets.*UTC").unwrap(),
        // Throttling
        Regex::new(r#""error"\s*:\s*"rate_limit""#).unwrap(),
        Regex::new(r"(?i)rate[\s_-]?limit").unwrap(),
        Regex::new(r"(?i)too\s+many\s+requests").unwrap(),
        Regex::new(r"(?i)quota\s+exceeded").unwrap(),
        Regex::new(r"\b(?:429|503)\b").unwrap(),
        // Transient unavailability
        Regex::new(r"(?i)please\s+try\s+again\s+later").unwrap(),
        Regex::new(r"(?i)temporarily\s+unavailable").unwrap(),
        // Chinese
        Regex::new(r"使用限制|速率限制|频率限制|请求过多|请求过于频繁").unwrap(),
        Regex::new(r"配额已用尽|超出配额|额度已用完").unwrap(),
        Regex::new(r"请?稍后(?:再试|重试)|暂时不可用").unwrap(),
        Regex::new(r"(?:达到|已达).{0,8}限制").unwrap(),
    ]
});

/// Check a chunk of output for limit patterns.
///
/// Returns `true` if any pattern matches anywhere in `text`.
pub fn is_limit_signal(text: &str) -> bool {
    for pattern in LIMIT_PATTERNS.iter() {
        if pattern.is_match(text) {
            tracing::debug!(pattern = %pattern, "limit pattern matched");
            return true;
        }
    }
    false
}

/// First-match-wins latch for a single execution.
///
/// Once a fragment has tripped it, further fragments are ignored so the
/// limit is handled at most once per run.
#[derive(Debug, Default)]
pub struct LimitLatch {
    tripped: bool,
}

impl LimitLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the first fragment that signals a limit.
    pub fn observe(&mut self, fragment: &str) -> bool {
        if self.tripped {
            return false;
        }
        if is_limit_signal(fragment) {
            self.tripped = true;
            return true;
        }
        false
    }
}
