//! The Match Engine: walks a compiled [`Forest`] against a byte source and
//! selects the most specific matching rule (spec.md §4.2).

use crate::error::{classify_io, EngineError};
use crate::rule::{Content, Forest, Kind, Node, NodeId, Operator};
use crate::source::{MarkableStream, RandomAccessSource};

/// How the caller wants results shaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchMode {
    /// Return only the single best candidate.
    MostSpecific,
    /// Return every matching candidate, most specific first.
    CollectAll,
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub default_unknown_mime: String,
    pub match_mode: MatchMode,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            default_unknown_mime: "application/octet-stream".to_string(),
            match_mode: MatchMode::MostSpecific,
        }
    }
}

/// One rule that matched and carried a MIME type.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub mime_type: String,
    pub node: NodeId,
    pub specificity: f64,
}

/// The outcome of one `identify`/`identify_stream` call.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchReport {
    /// The selected MIME type: the best candidate's, or
    /// `EngineOptions::default_unknown_mime` if nothing matched.
    pub mime_type: String,
    /// Populated only when `EngineOptions::match_mode` is `CollectAll`,
    /// sorted by descending specificity (ties broken by source order).
    pub candidates: Vec<Candidate>,
}

/// A window onto the bytes a rule needs, abstracting over where those bytes
/// actually came from (spec.md DESIGN NOTES: "dual byte-source path").
trait Window {
    /// Returns up to `len` bytes starting at `offset`; fewer if the
    /// underlying source is shorter.
    fn slice(&mut self, offset: u64, len: u32) -> Vec<u8>;
}

struct RandomAccessWindow<'a, S: RandomAccessSource + ?Sized>(&'a mut S);

impl<'a, S: RandomAccessSource + ?Sized> Window for RandomAccessWindow<'a, S> {
    fn slice(&mut self, offset: u64, len: u32) -> Vec<u8> {
        let mut buf = vec![0u8; len as usize];
        let n = self.0.read_at(offset, &mut buf).unwrap_or(0);
        buf.truncate(n);
        buf
    }
}

struct BufferWindow(Vec<u8>);

impl Window for BufferWindow {
    fn slice(&mut self, offset: u64, len: u32) -> Vec<u8> {
        if offset >= self.0.len() as u64 {
            return Vec::new();
        }
        let start = offset as usize;
        let end = (start + len as usize).min(self.0.len());
        self.0[start..end].to_vec()
    }
}

/// Identifies the MIME type of a random-access byte source.
pub fn identify<S: RandomAccessSource + ?Sized>(
    forest: &Forest,
    source: &mut S,
    options: &EngineOptions,
) -> MatchReport {
    let mut window = RandomAccessWindow(source);
    let candidates = collect_candidates(forest, &mut window);
    finalize(candidates, options)
}

/// Identifies the MIME type of a mark-capable byte stream. Marks the stream
/// with the forest's precomputed `max_read_length`, reads that window once,
/// and resets the stream before returning (spec.md §4.2, §5).
pub fn identify_stream<S: MarkableStream>(
    forest: &Forest,
    stream: &mut S,
    options: &EngineOptions,
) -> Result<MatchReport, EngineError> {
    let max_len = forest.max_read_length();
    let cap = usize::try_from(max_len).unwrap_or(usize::MAX);

    stream.mark(cap).map_err(classify_io)?;

    let mut buf = vec![0u8; cap];
    let mut total = 0;
    while total < buf.len() {
        let n = stream.read(&mut buf[total..]).map_err(classify_io)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);

    stream.reset().map_err(classify_io)?;

    let mut window = BufferWindow(buf);
    let candidates = collect_candidates(forest, &mut window);
    Ok(finalize(candidates, options))
}

fn finalize(mut candidates: Vec<Candidate>, options: &EngineOptions) -> MatchReport {
    let best = select_best(&candidates);
    let mime_type = best
        .map(|c| c.mime_type.clone())
        .unwrap_or_else(|| options.default_unknown_mime.clone());

    match options.match_mode {
        MatchMode::MostSpecific => MatchReport {
            mime_type,
            candidates: Vec::new(),
        },
        MatchMode::CollectAll => {
            candidates.sort_by(|a, b| {
                b.specificity
                    .partial_cmp(&a.specificity)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.node.cmp(&b.node))
            });
            MatchReport {
                mime_type,
                candidates,
            }
        }
    }
}

fn select_best(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().fold(None, |best, c| match best {
        None => Some(c),
        Some(b) => {
            if c.specificity > b.specificity {
                Some(c)
            } else if c.specificity < b.specificity {
                Some(b)
            } else if c.node < b.node {
                Some(c)
            } else {
                Some(b)
            }
        }
    })
}

fn collect_candidates(forest: &Forest, window: &mut dyn Window) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for &root in forest.roots() {
        evaluate_node(forest, window, root, &mut candidates);
    }
    candidates
}

/// Evaluates one node and, if it matches, its children. Returns whether this
/// node or any of its descendants contributed a candidate, so the caller
/// (its parent) knows whether to contribute itself (spec.md §4.2 steps 3-5).
fn evaluate_node(forest: &Forest, window: &mut dyn Window, id: NodeId, candidates: &mut Vec<Candidate>) -> bool {
    let node = forest.node(id);
    let bytes = window.slice(node.offset, node.width());

    if bytes.len() < node.width() as usize {
        log::trace!("rule {} short read at offset {}: no match", id, node.offset);
        return false;
    }

    if !match_one(node, &bytes) {
        return false;
    }

    let mut descendant_contributed = false;
    for &child in &node.children {
        if evaluate_node(forest, window, child, candidates) {
            descendant_contributed = true;
        }
    }

    if descendant_contributed {
        return true;
    }

    match &node.mime_type {
        Some(mime) => {
            log::debug!("rule {} matched, contributing {}", id, mime);
            candidates.push(Candidate {
                mime_type: mime.to_string(),
                node: id,
                specificity: forest.specificity(id),
            });
            true
        }
        None => false,
    }
}

/// Dispatch table for rule testing, total over [`Kind`] by construction.
fn match_one(node: &Node, data: &[u8]) -> bool {
    match node.kind {
        Kind::Unknown => false,
        Kind::String => match_string(node, data),
        Kind::Byte => match_numeric(node, data, 1, |b| u64::from(b[0])),
        Kind::Short | Kind::BeShort => match_numeric(node, data, 2, |b| u64::from(u16::from_be_bytes([b[0], b[1]]))),
        Kind::LeShort => match_numeric(node, data, 2, |b| u64::from(u16::from_le_bytes([b[0], b[1]]))),
        Kind::BeLong => match_numeric(node, data, 4, |b| u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))),
        Kind::LeLong => match_numeric(node, data, 4, |b| u64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))),
    }
}

fn match_string(node: &Node, data: &[u8]) -> bool {
    if let Some(n) = node.bounded_n {
        let n = n as usize;
        if data.len() < n {
            return false;
        }
        return contains_subsequence(&data[..n], node.content.as_bytes());
    }

    let content = node.content.as_bytes();
    if data.len() < content.len() {
        return false;
    }
    let window = &data[..content.len()];

    match node.operator {
        Operator::Equals => window == content,
        Operator::NotEquals => window != content,
        Operator::GreaterThan => window > content,
        Operator::LessThan => window < content,
        // Bitwise/any/negated are not defined for string kinds (spec.md §3).
        _ => false,
    }
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn match_numeric(node: &Node, data: &[u8], width: usize, extract: fn(&[u8]) -> u64) -> bool {
    if data.len() < width {
        return false;
    }
    let width_mask = node.kind.width_mask();
    // A `type&mask` suffix (e.g. `belong&0xFFFFFF00`) narrows which bits
    // participate in the comparison; both the extracted value and the
    // content are masked before the operator runs, so an unmasked bit
    // difference between them never affects the outcome.
    let mask = node.type_mask.unwrap_or(u64::MAX) & width_mask;
    let v = extract(data) & mask;
    let c = node.content.as_number() & mask;

    match node.operator {
        Operator::Equals => v == c,
        Operator::NotEquals => v != c,
        Operator::GreaterThan => v > c,
        Operator::LessThan => v < c,
        Operator::BitwiseAnd => (v & c) == c,
        // Equivalent to BitwiseAnd; kept distinct per spec.md DESIGN NOTES.
        Operator::BitwiseClear => ((v & c) ^ c) == 0,
        Operator::Any => true,
        Operator::Negated => (!v & mask) == c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::source::MarkReader;
    use std::io::Cursor;

    fn forest_from(text: &str) -> Forest {
        let (forest, diags) = compile(Cursor::new(text), "test");
        assert!(diags.is_empty(), "unexpected diagnostics: {:?}", diags);
        forest
    }

    #[test]
    fn pdf_signature_matches() {
        let forest = forest_from("0 string %PDF application/pdf\n");
        let mut data: &[u8] = b"%PDF-1.4";
        let report = identify(&forest, &mut data, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/pdf");
    }

    #[test]
    fn belong_png_signature_matches() {
        let forest = forest_from("0 belong 0x89504E47 image/png\n");
        let mut data: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        let report = identify(&forest, &mut data, &EngineOptions::default());
        assert_eq!(report.mime_type, "image/png");
    }

    #[test]
    fn leshort_endianness_matters() {
        let forest = forest_from("0 leshort 0xAA55 application/x-mbr\n");
        let mut wrong_order: &[u8] = &[0x55, 0xAA];
        let report = identify(&forest, &mut wrong_order, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/octet-stream");

        let mut right_order: &[u8] = &[0xAA, 0x55];
        let report = identify(&forest, &mut right_order, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/x-mbr");
    }

    #[test]
    fn belong_vs_lelong_distinguish_byte_order() {
        let forest = forest_from("0 belong 0x01020304 a/be\n");
        let mut be_bytes: &[u8] = &[0x01, 0x02, 0x03, 0x04];
        assert_eq!(
            identify(&forest, &mut be_bytes, &EngineOptions::default()).mime_type,
            "a/be"
        );
        let mut le_bytes: &[u8] = &[0x04, 0x03, 0x02, 0x01];
        assert_eq!(
            identify(&forest, &mut le_bytes, &EngineOptions::default()).mime_type,
            "application/octet-stream"
        );
    }

    #[test]
    fn more_specific_continuation_wins() {
        let rules = "0 string PK\\x03\\x04 application/zip\n>4 byte 0x14 application/vnd.openxmlformats\n";
        let forest = forest_from(rules);

        let mut office: &[u8] = &[0x50, 0x4B, 0x03, 0x04, 0x14, 0x00];
        let report = identify(&forest, &mut office, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/vnd.openxmlformats");

        let mut plain_zip: &[u8] = &[0x50, 0x4B, 0x03, 0x04, 0x00, 0x00];
        let report = identify(&forest, &mut plain_zip, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/zip");
    }

    #[test]
    fn masked_belong_matches_mp4_ftyp() {
        let forest = forest_from("4 belong&0xFFFFFF00 0x66747970 video/mp4\n");
        let mut data: &[u8] = &[
            0x00, 0x00, 0x00, 0x20, 0x66, 0x74, 0x79, 0x70, 0x6D, 0x70, 0x34, 0x32,
        ];
        let report = identify(&forest, &mut data, &EngineOptions::default());
        assert_eq!(report.mime_type, "video/mp4");
    }

    #[test]
    fn masked_belong_ignores_bits_outside_the_mask() {
        let forest = forest_from("4 belong&0xFFFFFF00 0x66747970 video/mp4\n");
        // Last byte of the 4-byte window differs (0x71 vs the content's
        // 0x70) but sits outside the mask, so the rule must still match.
        let mut data: &[u8] = &[0x00, 0x00, 0x00, 0x20, 0x66, 0x74, 0x79, 0x71];
        let report = identify(&forest, &mut data, &EngineOptions::default());
        assert_eq!(report.mime_type, "video/mp4");

        // A difference inside the masked bits must still fail to match.
        let mut wrong: &[u8] = &[0x00, 0x00, 0x00, 0x20, 0x66, 0x74, 0x78, 0x70];
        let report = identify(&forest, &mut wrong, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/octet-stream");
    }

    #[test]
    fn short_read_yields_no_match_without_panicking() {
        let forest = forest_from("0 belong 0x89504E47 image/png\n");
        let mut data: &[u8] = &[0x89, 0x50];
        let report = identify(&forest, &mut data, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/octet-stream");
    }

    #[test]
    fn stream_and_random_access_agree() {
        let rules = "0 string PK\\x03\\x04 application/zip\n>4 byte 0x14 application/vnd.openxmlformats\n";
        let forest = forest_from(rules);
        let bytes: &[u8] = &[0x50, 0x4B, 0x03, 0x04, 0x14, 0x00];

        let mut slice = bytes;
        let random_access_report = identify(&forest, &mut slice, &EngineOptions::default());

        let mut stream = MarkReader::new(Cursor::new(bytes.to_vec()));
        let stream_report = identify_stream(&forest, &mut stream, &EngineOptions::default()).unwrap();

        assert_eq!(random_access_report.mime_type, stream_report.mime_type);
    }

    #[test]
    fn collect_all_mode_returns_every_candidate_sorted_by_specificity() {
        let rules = "0 string A a/one\n0 string A a/two\n";
        let forest = forest_from(rules);
        let mut data: &[u8] = b"A";
        let options = EngineOptions {
            match_mode: MatchMode::CollectAll,
            ..EngineOptions::default()
        };
        let report = identify(&forest, &mut data, &options);
        assert_eq!(report.candidates.len(), 2);
        assert_eq!(report.mime_type, "a/one");
    }

    #[test]
    fn bounded_contains_form_matches_anywhere_in_window() {
        let forest = forest_from("0 string>20 PDF application/pdf\n");
        let mut data: &[u8] = b"junkjunkjunkjunkPDF!";
        let report = identify(&forest, &mut data, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/pdf");
    }

    #[test]
    fn negated_operator() {
        let forest = forest_from("0 byte ~0x0F a/neg\n");
        // ~v & 0xFF == 0x0F  =>  v == 0xF0
        let mut data: &[u8] = &[0xF0];
        let report = identify(&forest, &mut data, &EngineOptions::default());
        assert_eq!(report.mime_type, "a/neg");

        let mut not_matching: &[u8] = &[0x00];
        let report = identify(&forest, &mut not_matching, &EngineOptions::default());
        assert_eq!(report.mime_type, "application/octet-stream");
    }
}
