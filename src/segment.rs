//! Incremental sentence segmentation for streaming TTS prefetch
//!
//! Consumes an arbitrarily chunked character stream and emits complete
//! sentences as soon as they can be cut, so synthesis can start while the
//! LLM is still generating. Cutting is heuristic: hard terminators end a
//! sentence outright, soft breaks are only used when the buffer outgrows
//! `max_len`.

/// Characters that always end a sentence (when the minimum length is met).
const HARD_TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '；', ';', '\n'];

/// Characters acceptable as cut points when a sentence runs too long.
const SOFT_BREAKS: &[char] = &[',', '，', '、', ':', '：'];

/// Default minimum sentence length in codepoints.
pub const DEFAULT_MIN_LEN: usize = 5;

/// Default maximum sentence length in codepoints.
pub const DEFAULT_MAX_LEN: usize = 40;

/// Streaming sentence segmenter.
///
/// Feed it text deltas as they arrive; it returns complete sentences in
/// order. Call [`SentenceSegmenter::flush`] at end-of-stream to drain the
/// residual buffer. Lengths are counted in Unicode scalar values, so CJK
/// punctuation and text are first-class.
#[derive(Debug)]
pub struct SentenceSegmenter {
    buf: Vec<char>,
    min_len: usize,
    max_len: usize,
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_LEN, DEFAULT_MAX_LEN)
    }
}

impl SentenceSegmenter {
    /// Create a segmenter with explicit length bounds.
    ///
    /// `min_len` suppresses fragment emissions ("Hi." glued to the next
    /// sentence); `max_len` forces a cut so a long paragraph cannot stall
    /// synthesis until end-of-stream.
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            min_len: min_len.max(1),
            max_len: max_len.max(min_len.max(1)),
        }
    }

    /// Append a chunk and return any sentences completed by it.
    ///
    /// Never blocks, never fails; returns an empty vec while a sentence is
    /// still accumulating.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buf.extend(chunk.chars());
        self.drain_ready()
    }

    /// Drain the residual buffer at end-of-stream.
    ///
    /// Returns the remainder even if it is shorter than `min_len`; `None`
    /// when nothing but whitespace is left.
    pub fn flush(&mut self) -> Option<String> {
        let rest: String = self.buf.drain(..).collect();
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Number of codepoints currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn drain_ready(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            if let Some(end) = self.hard_break() {
                self.emit(end + 1, &mut out);
                continue;
            }
            if self.buf.len() > self.max_len {
                let cut = self.soft_cut().unwrap_or(self.max_len);
                self.emit(cut, &mut out);
                continue;
            }
            break;
        }
        out
    }

    /// First hard terminator that is a valid sentence end: minimum length
    /// met, decimal/abbreviation guard passed, and within the length window
    /// (a terminator past `max_len` is handled by the soft-cut path).
    fn hard_break(&self) -> Option<usize> {
        for (i, &c) in self.buf.iter().enumerate() {
            if i > self.max_len {
                break;
            }
            if !HARD_TERMINATORS.contains(&c) {
                continue;
            }
            if i + 1 < self.min_len {
                continue;
            }
            if c == '.' && self.dot_suppressed(i) {
                continue;
            }
            return Some(i);
        }
        None
    }

    /// Heuristic guard: a `.` inside `3.14` or `e.g.` does not end a
    /// sentence. When there is no lookahead yet the dot is treated as a
    /// sentence end; the occasional false cut is preferable to delaying
    /// every chunk-final sentence.
    fn dot_suppressed(&self, i: usize) -> bool {
        let next = self.buf.get(i + 1);
        if i > 0 && self.buf[i - 1].is_ascii_digit() && next.is_some_and(|c| c.is_ascii_digit()) {
            return true;
        }
        for j in i + 1..(i + 4).min(self.buf.len()) {
            let c = self.buf[j];
            if c == ' ' {
                continue;
            }
            return c.is_alphabetic() && c.is_lowercase();
        }
        false
    }

    /// Longest prefix ending in a soft break that fits the length window.
    fn soft_cut(&self) -> Option<usize> {
        let window = self.buf.len().min(self.max_len + 1);
        self.buf[..window]
            .iter()
            .rposition(|c| SOFT_BREAKS.contains(c))
            .filter(|&i| i + 1 >= self.min_len)
            .map(|i| i + 1)
    }

    fn emit(&mut self, n: usize, out: &mut Vec<String>) {
        let sentence: String = self.buf.drain(..n).collect();
        let trimmed = sentence.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
}
