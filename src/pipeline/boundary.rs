//! Text boundary buffering between the LLM token stream and the TTS.
//!
//! Tokens accumulate until a natural speech boundary, then flush as one
//! segment to the TTS. Sentence-terminal punctuation always flushes;
//! clause punctuation flushes once the buffer has grown past a soft byte
//! threshold; the bridge additionally flushes on an idle timeout so a slow
//! generation cannot starve the audio stream.

/// Accumulates LLM tokens and yields TTS-ready segments.
#[derive(Debug)]
pub struct BoundaryBuffer {
    buf: String,
    soft_limit: usize,
}

impl BoundaryBuffer {
    #[must_use]
    pub fn new(soft_limit: usize) -> Self {
        Self {
            buf: String::new(),
            soft_limit,
        }
    }

    /// Append token text and drain every completed segment.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut segments = Vec::new();
        while let Some(pos) = find_flush_boundary(&self.buf, self.soft_limit) {
            let segment = self.buf[..=pos].trim().to_owned();
            self.buf = self.buf[pos + 1..].to_owned();
            if !segment.is_empty() {
                segments.push(segment);
            }
        }
        segments
    }

    /// Drain the whole buffer regardless of boundaries. Used on idle
    /// timeout and at end of stream.
    pub fn drain(&mut self) -> Option<String> {
        let remaining = std::mem::take(&mut self.buf);
        let remaining = remaining.trim();
        if remaining.is_empty() {
            None
        } else {
            Some(remaining.to_owned())
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.trim().is_empty()
    }
}

/// Find the position of a sentence-ending character (`.`, `!`, `?`, `\n`).
///
/// Returns the byte index of the boundary character, or `None`. A match
/// only counts when followed by a space, a newline, or end of text, so
/// decimal points and mid-word punctuation don't split.
fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\n') {
                return Some(i);
            }
        }
    }
    None
}

/// Find a flush boundary for streaming TTS.
///
/// Sentence boundaries always flush. Once the buffer exceeds `soft_limit`
/// bytes, clause punctuation (`, ; : — –`) also flushes, at the *last*
/// such mark so segments stay as long as possible.
///
/// Callers slice `text[..=pos]` and `text[pos + 1..]`, so the returned
/// index is the last byte of the (possibly multi-byte) boundary character
/// to keep both slices on valid UTF-8 char boundaries.
fn find_flush_boundary(text: &str, soft_limit: usize) -> Option<usize> {
    if let Some(pos) = find_sentence_boundary(text) {
        return Some(pos);
    }

    if text.len() <= soft_limit {
        return None;
    }

    let mut last_clause: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':' | '\u{2014}' | '\u{2013}') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') {
                last_clause = Some(i + c.len_utf8() - 1);
            }
        }
    }
    last_clause
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOFT_LIMIT: usize = 60;

    #[test]
    fn sentence_punctuation_flushes_immediately() {
        let mut buf = BoundaryBuffer::new(SOFT_LIMIT);
        assert!(buf.push("Hello").is_empty());
        assert_eq!(buf.push(" there. How").as_slice(), ["Hello there."]);
        assert!(!buf.is_empty());
    }

    #[test]
    fn decimal_points_do_not_split() {
        let mut buf = BoundaryBuffer::new(SOFT_LIMIT);
        assert!(buf.push("pi is 3.14159 and").is_empty());
    }

    #[test]
    fn clause_punctuation_waits_for_soft_limit() {
        let mut buf = BoundaryBuffer::new(SOFT_LIMIT);
        assert!(buf.push("short, clause").is_empty());

        let mut buf = BoundaryBuffer::new(SOFT_LIMIT);
        let long = "a phrase that keeps going and going past sixty bytes in total, then more";
        let segments = buf.push(long);
        assert_eq!(
            segments.as_slice(),
            ["a phrase that keeps going and going past sixty bytes in total,"]
        );
    }

    #[test]
    fn clause_split_picks_the_last_mark() {
        let mut buf = BoundaryBuffer::new(SOFT_LIMIT);
        let text = "one clause here, two clauses here, three clauses in this long buffer, tail";
        let segments = buf.push(text);
        assert_eq!(
            segments.as_slice(),
            ["one clause here, two clauses here, three clauses in this long buffer,"]
        );
    }

    #[test]
    fn multiple_sentences_drain_in_order() {
        let mut buf = BoundaryBuffer::new(SOFT_LIMIT);
        let segments = buf.push("First. Second! Third");
        assert_eq!(segments.as_slice(), ["First.", "Second!"]);
        assert_eq!(buf.drain().as_deref(), Some("Third"));
        assert!(buf.is_empty());
    }

    #[test]
    fn em_dash_is_a_clause_boundary_past_the_limit() {
        let mut buf = BoundaryBuffer::new(SOFT_LIMIT);
        let text = "an opening that stretches well past the sixty byte threshold\u{2014} and then";
        let segments = buf.push(text);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].ends_with('\u{2014}'));
    }

    #[test]
    fn drain_of_whitespace_is_none() {
        let mut buf = BoundaryBuffer::new(SOFT_LIMIT);
        buf.push("   ");
        assert_eq!(buf.drain(), None);
    }
}
