//! Incremental inline-tag extraction: split a growing text stream into
//! segments inside and outside a single delimiter pair (e.g. a thinking tag)
//! without re-scanning already-emitted text.

/// One emitted segment. `matched` is true for text that fell inside the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSegment {
    pub matched: bool,
    pub data: String,
}

/// Two-state scanner over an unbounded sequence of text fragments.
///
/// Only the suffix that could still be the start of a delimiter is held back
/// between fragments, so a delimiter split across fragment boundaries is
/// still detected and buffered memory stays bounded by the longer delimiter.
#[derive(Debug)]
pub struct TagExtractor {
    open: String,
    close: String,
    inside: bool,
    buf: String,
}

impl TagExtractor {
    pub fn new(tag: &str) -> Self {
        Self {
            open: format!("<{tag}>"),
            close: format!("</{tag}>"),
            inside: false,
            buf: String::new(),
        }
    }

    /// Feed one fragment; returns the segments that are now certain.
    pub fn update(&mut self, fragment: &str) -> Vec<TagSegment> {
        self.buf.push_str(fragment);
        let mut out: Vec<TagSegment> = Vec::new();

        loop {
            let delim = if self.inside { &self.close } else { &self.open };
            match self.buf.find(delim.as_str()) {
                Some(pos) => {
                    if pos > 0 {
                        let data: String = self.buf.drain(..pos).collect();
                        push_segment(&mut out, self.inside, data);
                        self.buf.drain(..delim.len());
                    } else {
                        self.buf.drain(..delim.len());
                    }
                    self.inside = !self.inside;
                }
                None => {
                    // Hold back only what could still become the delimiter.
                    let hold = partial_suffix_len(&self.buf, delim);
                    let emit = self.buf.len() - hold;
                    if emit > 0 {
                        let data: String = self.buf.drain(..emit).collect();
                        push_segment(&mut out, self.inside, data);
                    }
                    break;
                }
            }
        }

        out
    }

    /// Flush any buffered partial match once the stream ends.
    pub fn finish(&mut self) -> Vec<TagSegment> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let data = std::mem::take(&mut self.buf);
        vec![TagSegment {
            matched: self.inside,
            data,
        }]
    }
}

fn push_segment(out: &mut Vec<TagSegment>, matched: bool, data: String) {
    if let Some(last) = out.last_mut() {
        if last.matched == matched {
            last.data.push_str(&data);
            return;
        }
    }
    out.push(TagSegment { matched, data });
}

/// Length of the longest proper suffix of `buf` that is a prefix of `delim`.
/// Delimiters are ASCII, so every byte match lands on a char boundary.
fn partial_suffix_len(buf: &str, delim: &str) -> usize {
    let max = delim.len().saturating_sub(1).min(buf.len());
    for len in (1..=max).rev() {
        if !buf.is_char_boundary(buf.len() - len) {
            continue;
        }
        if delim.as_bytes().starts_with(&buf.as_bytes()[buf.len() - len..]) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_fragments(fragments: &[&str]) -> Vec<TagSegment> {
        let mut ex = TagExtractor::new("think");
        let mut all = Vec::new();
        for f in fragments {
            for seg in ex.update(f) {
                merge(&mut all, seg);
            }
        }
        for seg in ex.finish() {
            merge(&mut all, seg);
        }
        all
    }

    fn merge(all: &mut Vec<TagSegment>, seg: TagSegment) {
        if let Some(last) = all.last_mut() {
            if last.matched == seg.matched {
                last.data.push_str(&seg.data);
                return;
            }
        }
        all.push(seg);
    }

    fn seg(matched: bool, data: &str) -> TagSegment {
        TagSegment {
            matched,
            data: data.into(),
        }
    }

    #[test]
    fn whole_string_at_once() {
        let got = run_fragments(&["before<think>inner</think>after"]);
        assert_eq!(
            got,
            vec![seg(false, "before"), seg(true, "inner"), seg(false, "after")]
        );
    }

    #[test]
    fn delimiter_split_across_fragments() {
        let got = run_fragments(&["before<thi", "nk>inner</th", "ink>after"]);
        assert_eq!(
            got,
            vec![seg(false, "before"), seg(true, "inner"), seg(false, "after")]
        );
    }

    #[test]
    fn one_char_fragments() {
        let text = "a<think>b</think>c";
        let fragments: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = fragments.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            run_fragments(&refs),
            vec![seg(false, "a"), seg(true, "b"), seg(false, "c")]
        );
    }

    #[test]
    fn all_two_way_splits_agree_with_single_scan() {
        let text = "x<think>thought</think>answer<think>more</think>";
        let expected = run_fragments(&[text]);
        for i in 0..=text.len() {
            if !text.is_char_boundary(i) {
                continue;
            }
            let got = run_fragments(&[&text[..i], &text[i..]]);
            assert_eq!(got, expected, "split at {i}");
        }
    }

    #[test]
    fn unmatched_partial_open_is_flushed_at_end() {
        let got = run_fragments(&["hello <thi"]);
        assert_eq!(got, vec![seg(false, "hello <thi")]);
    }

    #[test]
    fn unterminated_tag_flushes_as_matched() {
        let got = run_fragments(&["<think>still going"]);
        assert_eq!(got, vec![seg(true, "still going")]);
    }

    #[test]
    fn angle_brackets_that_are_not_the_tag_pass_through() {
        let got = run_fragments(&["a < b and <other> tags"]);
        assert_eq!(got, vec![seg(false, "a < b and <other> tags")]);
    }

    #[test]
    fn empty_tag_body() {
        let got = run_fragments(&["<think></think>done"]);
        assert_eq!(got, vec![seg(false, "done")]);
    }

    #[test]
    fn multibyte_text_around_boundaries() {
        let got = run_fragments(&["héllo<thi", "nk>wörld</think>ok"]);
        assert_eq!(
            got,
            vec![seg(false, "héllo"), seg(true, "wörld"), seg(false, "ok")]
        );
    }
}
