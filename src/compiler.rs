//! The Rule Compiler: turns a textual magic rules document into a
//! [`Forest`], collecting a [`Diagnostic`] for every line it could not use.
//!
//! The line grammar (spec.md §4.1):
//!
//! ```text
//! [>*] offset  type  content  [mime_type  [mime_encoding]]
//! ```

use std::io::BufRead;
use std::str::FromStr;

use mime::Mime;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::char;
use nom::combinator::{map, opt, value};
use nom::multi::many0;
use nom::sequence::tuple;
use nom::IResult;

use crate::error::{CompileError, Diagnostic};
use crate::rule::{compute_weighted_sums, Content, Forest, Kind, Node, NodeId, Operator};

/// Compiles `reader`'s lines into a [`Forest`] plus the diagnostics for any
/// line that was discarded. `source_name` is only used to label
/// diagnostics.
pub fn compile<R: BufRead>(reader: R, source_name: &str) -> (Forest, Vec<Diagnostic>) {
    let mut nodes: Vec<Node> = Vec::new();
    let mut roots: Vec<NodeId> = Vec::new();
    let mut cursors: Vec<NodeId> = Vec::new();
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    for (idx, line_result) in reader.lines().enumerate() {
        let line_no = idx + 1;

        let raw = match line_result {
            Ok(l) => l,
            Err(err) => {
                diagnostics.push(Diagnostic::from_error(
                    source_name,
                    line_no,
                    CompileError::ReadError(err.to_string()),
                ));
                continue;
            }
        };

        // Trailing CR from CRLF-terminated input; trailing whitespace is
        // cosmetic and must not affect field parsing.
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim_start();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (depth, rest) = count_depth(line);

        let fields = tokenize_fields(rest);
        if fields.len() < 3 {
            diagnostics.push(Diagnostic::from_error(source_name, line_no, CompileError::TruncatedLine));
            continue;
        }

        if depth as usize > cursors.len() {
            diagnostics.push(Diagnostic::from_error(
                source_name,
                line_no,
                CompileError::InconsistentDepth {
                    found: depth,
                    max: cursors.len(),
                },
            ));
            continue;
        }

        let built = match build_node(&fields, depth, source_name, line_no, &mut diagnostics) {
            Some(n) => n,
            None => continue,
        };

        let id = nodes.len();
        let parent = if depth == 0 {
            None
        } else {
            Some(cursors[depth as usize - 1])
        };

        nodes.push(Node {
            id,
            parent,
            depth,
            children: Vec::new(),
            ..built
        });

        match parent {
            Some(pid) => nodes[pid].children.push(id),
            None => roots.push(id),
        }

        cursors.truncate(depth as usize);
        cursors.push(id);
    }

    let weighted_sum = compute_weighted_sums(&nodes);

    (
        Forest {
            nodes,
            roots,
            weighted_sum,
        },
        diagnostics,
    )
}

/// Counts leading `>` markers and returns the remainder of the line.
fn count_depth(line: &str) -> (u32, &str) {
    fn markers(input: &str) -> IResult<&str, &str> {
        take_while1(|c| c == '>')(input)
    }

    match markers(line) {
        Ok((rest, gts)) => (gts.chars().count() as u32, rest),
        Err(_) => (0, line),
    }
}

/// Splits a line (with its leading `>` markers already stripped) into
/// whitespace-separated fields, treating any backslash-escaped character
/// — including an escaped space — as part of the current field rather than
/// a separator.
fn tokenize_fields(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let n = bytes.len();
    let mut fields = Vec::new();
    let mut i = 0;

    while i < n {
        while i < n && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= n {
            break;
        }

        let start = i;
        while i < n {
            if bytes[i].is_ascii_whitespace() {
                break;
            }
            if bytes[i] == b'\\' && i + 1 < n {
                i += 2;
                continue;
            }
            i += 1;
        }
        fields.push(&line[start..i]);
    }

    fields
}

fn build_node(
    fields: &[&str],
    depth: u32,
    source_name: &str,
    line_no: usize,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Node> {
    let offset = match parse_offset(fields[0]) {
        Ok(v) => v,
        Err(err) => {
            diagnostics.push(Diagnostic::from_error(source_name, line_no, err));
            return None;
        }
    };

    let (parsed_kind, bounded_n, mask_result) = parse_type(fields[1]);
    let mut kind = parsed_kind;
    let mut type_mask = None;

    match mask_result {
        Ok(mask) => {
            type_mask = mask;
            if kind == Kind::Unknown {
                diagnostics.push(Diagnostic::from_error(
                    source_name,
                    line_no,
                    CompileError::UnknownType(fields[1].to_string()),
                ));
            }
        }
        Err(err) => {
            diagnostics.push(Diagnostic::from_error(source_name, line_no, err));
            kind = Kind::Unknown;
        }
    }

    let (operator, content) = match kind {
        Kind::Unknown => (Operator::Equals, Content::Bytes(fields[2].as_bytes().to_vec())),
        Kind::String => {
            let (op, rest) = split_string_operator(fields[2]);
            (op, Content::Bytes(decode_escapes(rest)))
        }
        _ => {
            let (op, rest) = split_numeric_operator(fields[2]);
            match parse_numeric_content(rest) {
                Ok(v) => (op, Content::Number(v)),
                Err(err) => {
                    diagnostics.push(Diagnostic::from_error(source_name, line_no, err));
                    return None;
                }
            }
        }
    };

    let mime_type = match fields.get(3) {
        Some(s) => match Mime::from_str(s) {
            Ok(m) => Some(m),
            Err(_) => {
                diagnostics.push(Diagnostic::from_error(
                    source_name,
                    line_no,
                    CompileError::InvalidMimeType(s.to_string()),
                ));
                None
            }
        },
        None => None,
    };

    let mime_encoding = fields.get(4).map(|s| s.to_string());

    Some(Node {
        id: 0,
        offset,
        kind,
        operator,
        content,
        bounded_n,
        type_mask,
        mime_type,
        mime_encoding,
        depth,
        parent: None,
        children: Vec::new(),
    })
}

fn parse_offset(s: &str) -> Result<u64, CompileError> {
    fn hex_offset(input: &str) -> IResult<&str, u64> {
        let (input, _) = alt((tag("0x"), tag("0X")))(input)?;
        map(take_while1(|c: char| c.is_ascii_hexdigit()), |digits: &str| {
            u64::from_str_radix(digits, 16).unwrap_or(0)
        })(input)
    }

    match hex_offset(s) {
        Ok((rest, v)) if rest.is_empty() => Ok(v),
        _ => s
            .parse::<u64>()
            .map_err(|_| CompileError::InvalidOffset(s.to_string())),
    }
}

/// Matches the type field against each known literal, per spec.md §4.1.
/// Returns the declared bound for a `string>N` form, and — for numeric
/// kinds — the parsed mask from a `type&mask` suffix (e.g.
/// `belong&0xFFFFFF00`, scenario 6 of spec.md §8). The mask slot is
/// `Err(message)` only when a suffix is present but fails to parse; a type
/// with no recognized literal at all still returns `Ok(None)` so the
/// generic "unknown type" diagnostic (not this one) is the one raised.
fn parse_type(s: &str) -> (Kind, Option<u32>, Result<Option<u64>, CompileError>) {
    if let Some(rest) = s.strip_prefix("string") {
        return (Kind::String, parse_bounded_suffix(rest), Ok(None));
    }

    const NUMERIC_KINDS: [(&str, Kind); 6] = [
        ("byte", Kind::Byte),
        ("short", Kind::Short),
        ("beshort", Kind::BeShort),
        ("leshort", Kind::LeShort),
        ("belong", Kind::BeLong),
        ("lelong", Kind::LeLong),
    ];

    for (literal, kind) in NUMERIC_KINDS {
        if let Some(mask_result) = parse_numeric_type_suffix(s, literal) {
            return (kind, None, mask_result);
        }
    }

    (Kind::Unknown, None, Ok(None))
}

/// If `s` is exactly `literal` or `literal&<mask>`, returns the parsed mask
/// (`Ok(None)` for the bare form, `Ok(Some(mask))` for a valid suffix,
/// `Err` for a malformed one). Returns `None` if `s` isn't this literal at
/// all, so the caller can try the next candidate.
fn parse_numeric_type_suffix(s: &str, literal: &str) -> Option<Result<Option<u64>, CompileError>> {
    if s == literal {
        return Some(Ok(None));
    }
    let rest = s.strip_prefix(literal)?;
    let hex = rest.strip_prefix('&')?;
    Some(
        parse_numeric_content(hex)
            .map(Some)
            .map_err(|_| CompileError::InvalidTypeMask(s.to_string())),
    )
}

fn parse_bounded_suffix(rest: &str) -> Option<u32> {
    fn bound(input: &str) -> IResult<&str, u32> {
        let (input, _) = char('>')(input)?;
        map(take_while1(|c: char| c.is_ascii_digit()), |digits: &str| {
            digits.parse::<u32>().unwrap_or(0)
        })(input)
    }

    bound(rest).ok().map(|(_, n)| n)
}

fn split_string_operator(s: &str) -> (Operator, &str) {
    match s.chars().next() {
        Some('=') => (Operator::Equals, &s[1..]),
        Some('!') => (Operator::NotEquals, &s[1..]),
        Some('>') => (Operator::GreaterThan, &s[1..]),
        Some('<') => (Operator::LessThan, &s[1..]),
        _ => (Operator::Equals, s),
    }
}

fn split_numeric_operator(s: &str) -> (Operator, &str) {
    match s.chars().next() {
        Some('=') => (Operator::Equals, &s[1..]),
        Some('!') => (Operator::NotEquals, &s[1..]),
        Some('>') => (Operator::GreaterThan, &s[1..]),
        Some('<') => (Operator::LessThan, &s[1..]),
        Some('&') => (Operator::BitwiseAnd, &s[1..]),
        Some('^') => (Operator::BitwiseClear, &s[1..]),
        Some('x') => (Operator::Any, &s[1..]),
        Some('~') => (Operator::Negated, &s[1..]),
        _ => (Operator::Equals, s),
    }
}

fn parse_numeric_content(s: &str) -> Result<u64, CompileError> {
    if s.is_empty() {
        return Ok(0);
    }

    fn hex(input: &str) -> IResult<&str, &str> {
        let (input, _) = alt((tag("0x"), tag("0X")))(input)?;
        take_while1(|c: char| c.is_ascii_hexdigit())(input)
    }

    if let Ok((rest, digits)) = hex(s) {
        if rest.is_empty() {
            return u64::from_str_radix(digits, 16)
                .map_err(|_| CompileError::InvalidNumericContent(s.to_string()));
        }
    }

    if s.starts_with('0') && s.len() > 1 {
        return u64::from_str_radix(&s[1..], 8).map_err(|_| CompileError::InvalidNumericContent(s.to_string()));
    }

    s.parse::<u64>()
        .map_err(|_| CompileError::InvalidNumericContent(s.to_string()))
}

/// Decodes the escape sequences described in spec.md §4.1 in a single
/// left-to-right pass. A raw newline can't appear here (the caller already
/// split the document into lines), but is handled defensively anyway.
fn decode_escapes(s: &str) -> Vec<u8> {
    fn escape(input: &str) -> IResult<&str, u8> {
        let (input, _) = char('\\')(input)?;
        alt((
            value(b'\\', char('\\')),
            value(b' ', char(' ')),
            value(b'\t', char('t')),
            value(b'\n', char('n')),
            value(b'\r', char('r')),
            hex_escape,
            octal_escape,
            map(nom::character::complete::anychar, |c| c as u8),
        ))(input)
    }

    fn hex_escape(input: &str) -> IResult<&str, u8> {
        let (input, (_, digits)) = tuple((
            char('x'),
            nom::bytes::complete::take(2usize),
        ))(input)?;
        match u8::from_str_radix(digits, 16) {
            Ok(byte) => Ok((input, byte)),
            Err(_) => Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::HexDigit,
            ))),
        }
    }

    fn octal_escape(input: &str) -> IResult<&str, u8> {
        let (input, digits) = take_octal_digits(input)?;
        if digits.is_empty() {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::OctDigit,
            )));
        }
        let value = u16::from_str_radix(digits, 8).unwrap_or(0);
        Ok((input, value as u8))
    }

    fn take_octal_digits(input: &str) -> IResult<&str, &str> {
        let mut end = 0;
        for (count, c) in input.chars().enumerate() {
            if count >= 3 || !('0'..='7').contains(&c) {
                break;
            }
            end += c.len_utf8();
        }
        Ok((&input[end..], &input[..end]))
    }

    let mut out = Vec::with_capacity(s.len());
    let mut rest = s;

    while !rest.is_empty() {
        if rest.starts_with('\n') {
            break;
        }

        match escape(rest) {
            Ok((tail, byte)) => {
                out.push(byte);
                rest = tail;
            }
            Err(_) => {
                let mut chars = rest.chars();
                let c = chars.next().unwrap();
                out.extend_from_slice(c.to_string().as_bytes());
                rest = chars.as_str();
            }
        }
    }

    out
}
