//! Streaming byte substitution.
//!
//! Response bodies are rewritten on the fly, so the matcher must work across
//! read boundaries without buffering the whole stream: a KMP prefix automaton
//! keeps its state between reads and only holds back the bytes of a partial
//! match at the end of a chunk.

use std::collections::VecDeque;
use std::io;
use std::io::Read;

const CHUNK_SIZE: usize = 8 * 1024;

/// Wraps a reader, replacing every occurrence of `pattern` with `replacement`.
///
/// Matches are non-overlapping and found in left-to-right order. The pattern
/// must not be empty (enforced where replace rules are built).
pub struct ReplaceReader<R> {
    inner: R,
    pattern: Vec<u8>,
    replacement: Vec<u8>,
    /// KMP failure function of `pattern`.
    lps: Vec<usize>,
    /// Number of pattern bytes currently matched; these bytes are held back.
    matched: usize,
    /// Bytes ready to be handed to the caller.
    out: VecDeque<u8>,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: Read> ReplaceReader<R> {
    pub fn new(inner: R, pattern: &[u8], replacement: &[u8]) -> Self {
        assert!(!pattern.is_empty(), "replace pattern must not be empty");
        ReplaceReader {
            inner,
            lps: failure_function(pattern),
            pattern: pattern.to_vec(),
            replacement: replacement.to_vec(),
            matched: 0,
            out: VecDeque::new(),
            chunk: vec![0; CHUNK_SIZE],
            eof: false,
        }
    }

    fn push_byte(&mut self, byte: u8) {
        loop {
            if self.pattern[self.matched] == byte {
                self.matched += 1;
                if self.matched == self.pattern.len() {
                    self.out.extend(self.replacement.iter().copied());
                    self.matched = 0;
                }
                return;
            }
            if self.matched == 0 {
                self.out.push_back(byte);
                return;
            }
            // The first `matched - next` held-back bytes can no longer start
            // a match; release them and retry `byte` in the shorter state.
            let next = self.lps[self.matched - 1];
            self.out
                .extend(self.pattern[..self.matched - next].iter().copied());
            self.matched = next;
        }
    }

    fn flush_partial_match(&mut self) {
        let matched = self.matched;
        self.out.extend(self.pattern[..matched].iter().copied());
        self.matched = 0;
    }
}

impl<R: Read> Read for ReplaceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.out.is_empty() && !self.eof {
            let n = self.inner.read(&mut self.chunk)?;
            if n == 0 {
                self.eof = true;
                self.flush_partial_match();
                break;
            }
            for i in 0..n {
                let byte = self.chunk[i];
                self.push_byte(byte);
            }
        }
        let n = buf.len().min(self.out.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.out.pop_front().expect("sized by out.len()");
        }
        Ok(n)
    }
}

/// Classic KMP failure function: `lps[i]` is the length of the longest proper
/// prefix of `pattern[..=i]` that is also a suffix of it.
fn failure_function(pattern: &[u8]) -> Vec<usize> {
    let mut lps = vec![0; pattern.len()];
    let mut len = 0;
    let mut i = 1;
    while i < pattern.len() {
        if pattern[i] == pattern[len] {
            len += 1;
            lps[i] = len;
            i += 1;
        } else if len != 0 {
            len = lps[len - 1];
        } else {
            lps[i] = 0;
            i += 1;
        }
    }
    lps
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields the wrapped data one byte per read call, to exercise chunk
    /// boundaries in the middle of matches.
    struct TrickleReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl TrickleReader {
        fn new(data: &[u8]) -> Self {
            TrickleReader {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl Read for TrickleReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    fn replace_all(input: &[u8], pattern: &[u8], replacement: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        ReplaceReader::new(input, pattern, replacement)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn replace_trickled(input: &[u8], pattern: &[u8], replacement: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        ReplaceReader::new(TrickleReader::new(input), pattern, replacement)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_replaces_single_occurrence() {
        assert_eq!(
            replace_all(b"hello world", b"world", b"there"),
            b"hello there"
        );
    }

    #[test]
    fn test_replaces_multiple_occurrences() {
        assert_eq!(replace_all(b"a-b-a-b", b"b", b"c"), b"a-c-a-c");
    }

    #[test]
    fn test_passes_through_without_match() {
        assert_eq!(replace_all(b"hello world", b"xyz", b"abc"), b"hello world");
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(replace_all(b"", b"pattern", b"x"), b"");
    }

    #[test]
    fn test_single_byte_body() {
        assert_eq!(replace_all(b"a", b"a", b"bb"), b"bb");
        assert_eq!(replace_all(b"a", b"b", b"cc"), b"a");
    }

    #[test]
    fn test_body_equal_to_pattern() {
        assert_eq!(replace_all(b"needle", b"needle", b""), b"");
    }

    #[test]
    fn test_partial_match_at_end_of_stream_is_released() {
        assert_eq!(replace_all(b"abcab", b"abcabc", b"x"), b"abcab");
    }

    #[test]
    fn test_match_spanning_read_boundaries() {
        assert_eq!(
            replace_trickled(b"xxneedleyy", b"needle", b"pin"),
            b"xxpinyy"
        );
    }

    #[test]
    fn test_self_overlapping_pattern_across_boundaries() {
        // The failure function has to rewind correctly when a partial match
        // restarts inside itself.
        assert_eq!(replace_trickled(b"aabaabaab", b"aabaab", b"!"), b"!aab");
        assert_eq!(replace_trickled(b"aaaa", b"aa", b"b"), b"bb");
    }

    #[test]
    fn test_replacement_longer_than_pattern() {
        assert_eq!(
            replace_trickled(b"ababab", b"ab", b"12345"),
            b"123451234512345"
        );
    }

    #[test]
    fn test_released_prefix_bytes_stay_in_order() {
        // "aab" fails against pattern "aac" after two matched bytes; the
        // held-back "a" must come out before the retried byte.
        assert_eq!(replace_trickled(b"aab", b"aac", b"x"), b"aab");
    }
}
