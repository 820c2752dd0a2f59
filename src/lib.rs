//! magic-core compiles magic(5)-style byte-signature rules into an immutable
//! rule forest, and matches byte sources against that forest to find the
//! most specific applicable MIME type.
//!
//! ## Compiling rules
//!
//! A [`MagicDatabase`] is built once from one or more rule documents and then
//! queried many times; the resulting [`Forest`] is immutable and safe to
//! share across threads.
//!
//! ```no_run
//! use magic_core::MagicDatabase;
//!
//! let rules = "0 string %PDF application/pdf\n";
//! let db = MagicDatabase::compile(rules.as_bytes(), "builtin").unwrap();
//!
//! let report = db.identify(&mut b"%PDF-1.4".as_ref());
//! assert_eq!(report.mime_type, "application/pdf");
//! ```
//!
//! ## Identifying data
//!
//! Two entry points mirror the two kinds of byte source a caller might have:
//! [`MagicDatabase::identify`] for anything implementing
//! [`RandomAccessSource`] (a file, a byte slice), and
//! [`MagicDatabase::identify_stream`] for a forward-only
//! [`MarkableStream`] that can't be seeked.

#![allow(dead_code)]

mod compiler;
mod engine;
mod error;
mod rule;
mod source;

pub use compiler::compile;
pub use engine::{identify, identify_stream, Candidate, EngineOptions, MatchMode, MatchReport};
pub use error::{CompileError, Diagnostic, EngineError};
pub use rule::{Content, Forest, Kind, Node, NodeId, Operator};
pub use source::{FileSource, MarkReader, MarkableStream, RandomAccessSource};

use std::io::BufRead;

/// A compiled rule forest plus the diagnostics produced while compiling it.
///
/// Compilation never fails outright — a malformed line is recorded as a
/// [`Diagnostic`] and skipped, so `compile` always returns a usable (if
/// possibly empty) forest. This facade exists for the common case of
/// compiling once and then matching many times.
pub struct MagicDatabase {
    forest: Forest,
    diagnostics: Vec<Diagnostic>,
}

impl MagicDatabase {
    /// Compiles `reader`'s lines into a rule forest. `source_name` labels any
    /// diagnostics produced; it has no effect on matching.
    pub fn compile<R: BufRead>(reader: R, source_name: &str) -> Result<Self, EngineError> {
        let (forest, diagnostics) = compiler::compile(reader, source_name);
        for diag in &diagnostics {
            log::warn!("{diag}");
        }
        Ok(MagicDatabase { forest, diagnostics })
    }

    /// Merges another compiled document's rules into this database, so a
    /// caller can build up a forest from several rule files the way `file(1)`
    /// layers `/etc/magic` over its own database.
    pub fn extend<R: BufRead>(&mut self, reader: R, source_name: &str) -> Result<(), EngineError> {
        let (mut other, mut diagnostics) = compiler::compile(reader, source_name);
        let offset = self.forest.nodes.len();

        for node in &mut other.nodes {
            node.id += offset;
            node.parent = node.parent.map(|p| p + offset);
            node.children.iter_mut().for_each(|c| *c += offset);
        }
        self.forest.roots.extend(other.roots.into_iter().map(|r| r + offset));
        self.forest.nodes.extend(other.nodes);
        self.forest.weighted_sum = rule::compute_weighted_sums(&self.forest.nodes);

        for diag in &diagnostics {
            log::warn!("{diag}");
        }
        self.diagnostics.append(&mut diagnostics);
        Ok(())
    }

    /// The diagnostics accumulated across every `compile`/`extend` call.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// The compiled forest, for callers that want lower-level access (e.g.
    /// inspecting `rule_count`/`max_depth`).
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// Identifies the MIME type of a random-access byte source using the
    /// default [`EngineOptions`].
    pub fn identify<S: RandomAccessSource + ?Sized>(&self, source: &mut S) -> MatchReport {
        self.identify_with(source, &EngineOptions::default())
    }

    /// Identifies the MIME type of a random-access byte source.
    pub fn identify_with<S: RandomAccessSource + ?Sized>(
        &self,
        source: &mut S,
        options: &EngineOptions,
    ) -> MatchReport {
        engine::identify(&self.forest, source, options)
    }

    /// Identifies the MIME type of a mark-capable stream using the default
    /// [`EngineOptions`].
    pub fn identify_stream<S: MarkableStream>(&self, stream: &mut S) -> Result<MatchReport, EngineError> {
        self.identify_stream_with(stream, &EngineOptions::default())
    }

    /// Identifies the MIME type of a mark-capable stream.
    pub fn identify_stream_with<S: MarkableStream>(
        &self,
        stream: &mut S,
        options: &EngineOptions,
    ) -> Result<MatchReport, EngineError> {
        engine::identify_stream(&self.forest, stream, options)
    }
}
