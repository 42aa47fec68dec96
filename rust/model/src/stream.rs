// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming access to documents.
//!
//! A document is a header followed by top-level members, each either a
//! feature or a global appearance. On disk this is JSON lines, one object per
//! line, discriminated by a `member` field:
//!
//! ```text
//! {"member":"header","srs":"EPSG:25832"}
//! {"member":"feature","type":"Building","id":"b1","geometry":[...]}
//! {"member":"appearance","theme":"rgb","surfaceData":[...]}
//! ```
//!
//! A [`DocumentSource`] can be opened any number of times, which is what
//! multi-pass processing relies on. A [`MemberFilter`] lets a pass skip
//! members it does not care about after peeking at their tag only.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::serialization::{AppearanceRecord, DocumentHeader, FeatureRecord};

/// A top-level document member.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentMember {
    Feature(FeatureRecord),
    Appearance(AppearanceRecord),
}

impl DocumentMember {
    pub fn as_feature(&self) -> Option<&FeatureRecord> {
        match self {
            DocumentMember::Feature(f) => Some(f),
            DocumentMember::Appearance(_) => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "member", rename_all = "lowercase")]
enum Line {
    Header(DocumentHeader),
    Feature(FeatureRecord),
    Appearance(AppearanceRecord),
}

#[derive(Serialize)]
#[serde(tag = "member", rename_all = "lowercase")]
enum LineRef<'a> {
    Header(&'a DocumentHeader),
    Feature(&'a FeatureRecord),
    Appearance(&'a AppearanceRecord),
}

/// Tag-only view of a line.
#[derive(Deserialize)]
struct Peek {
    member: String,
    #[serde(rename = "type", default)]
    feature_type: Option<String>,
}

/// Selects which members a reader yields.
#[derive(Debug, Clone)]
pub struct MemberFilter {
    pub features: bool,
    pub appearances: bool,
    /// When set, only features of these types are yielded.
    pub feature_types: Option<FxHashSet<String>>,
}

impl MemberFilter {
    pub fn all() -> Self {
        Self {
            features: true,
            appearances: true,
            feature_types: None,
        }
    }

    pub fn features() -> Self {
        Self {
            appearances: false,
            ..Self::all()
        }
    }

    pub fn appearances() -> Self {
        Self {
            features: false,
            ..Self::all()
        }
    }

    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.feature_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    fn admits_feature(&self, feature_type: Option<&str>) -> bool {
        self.features
            && match (&self.feature_types, feature_type) {
                (None, _) => true,
                (Some(types), Some(ty)) => types.contains(ty),
                (Some(_), None) => false,
            }
    }

    /// Decides from the tag whether a member is worth a full parse.
    fn admits_tag(&self, member: &str, feature_type: Option<&str>) -> bool {
        match member {
            "feature" => self.admits_feature(feature_type),
            "appearance" => self.appearances,
            _ => false,
        }
    }

    pub fn admits(&self, member: &DocumentMember) -> bool {
        match member {
            DocumentMember::Feature(f) => self.admits_feature(Some(&f.feature_type)),
            DocumentMember::Appearance(_) => self.appearances,
        }
    }
}

impl Default for MemberFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Pull-style reader over the members of an opened document.
pub trait FeatureReader {
    /// The next admitted member, or `None` at the end of the document.
    fn next_member(&mut self) -> Result<Option<DocumentMember>>;
}

/// A document that can be opened for reading repeatedly.
pub trait DocumentSource {
    /// Name used in log messages.
    fn name(&self) -> &str;

    fn header(&self) -> Result<DocumentHeader>;

    fn open(&self, filter: MemberFilter) -> Result<Box<dyn FeatureReader + '_>>;
}

/// Sink for a processed document.
pub trait FeatureWriter {
    fn write_header(&mut self, header: &DocumentHeader) -> Result<()>;

    fn write_member(&mut self, member: &DocumentMember) -> Result<()>;

    /// Flushes everything written. No member may be written afterwards.
    fn finish(&mut self) -> Result<()>;
}

// =============================================================================
// JSON lines
// =============================================================================

/// A JSON-lines document on disk.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
    name: String,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentSource for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> Result<DocumentHeader> {
        let mut lines = BufReader::new(File::open(&self.path)?).lines();
        let mut number = 0;
        while let Some(line) = lines.next().transpose()? {
            number += 1;
            if line.trim().is_empty() {
                continue;
            }
            return match serde_json::from_str::<Line>(&line) {
                Ok(Line::Header(header)) => Ok(header),
                Ok(_) => Err(Error::MissingHeader(self.name.clone())),
                Err(source) => Err(Error::Json {
                    line: number,
                    source,
                }),
            };
        }
        Err(Error::MissingHeader(self.name.clone()))
    }

    fn open(&self, filter: MemberFilter) -> Result<Box<dyn FeatureReader + '_>> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(Box::new(JsonLinesReader {
            reader,
            filter,
            line: 0,
            buffer: String::new(),
        }))
    }
}

struct JsonLinesReader<R> {
    reader: R,
    filter: MemberFilter,
    line: usize,
    buffer: String,
}

impl<R: BufRead> FeatureReader for JsonLinesReader<R> {
    fn next_member(&mut self) -> Result<Option<DocumentMember>> {
        loop {
            self.buffer.clear();
            if self.reader.read_line(&mut self.buffer)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            let text = self.buffer.trim();
            if text.is_empty() {
                continue;
            }

            let peek: Peek = serde_json::from_str(text).map_err(|source| Error::Json {
                line: self.line,
                source,
            })?;
            if !self.filter.admits_tag(&peek.member, peek.feature_type.as_deref()) {
                continue;
            }

            let parsed: Line = serde_json::from_str(text).map_err(|source| Error::Json {
                line: self.line,
                source,
            })?;
            return Ok(Some(match parsed {
                Line::Feature(f) => DocumentMember::Feature(f),
                Line::Appearance(a) => DocumentMember::Appearance(a),
                Line::Header(_) => continue,
            }));
        }
    }
}

/// Writes a document as JSON lines.
pub struct JsonLinesWriter<W: Write> {
    out: W,
    members: usize,
}

impl JsonLinesWriter<BufWriter<File>> {
    /// Creates (or truncates) a file, creating parent directories as needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, members: 0 }
    }

    /// Number of members written so far.
    pub fn members_written(&self) -> usize {
        self.members
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &LineRef<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, line)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> FeatureWriter for JsonLinesWriter<W> {
    fn write_header(&mut self, header: &DocumentHeader) -> Result<()> {
        self.write_line(&LineRef::Header(header))
    }

    fn write_member(&mut self, member: &DocumentMember) -> Result<()> {
        let line = match member {
            DocumentMember::Feature(f) => LineRef::Feature(f),
            DocumentMember::Appearance(a) => LineRef::Appearance(a),
        };
        self.write_line(&line)?;
        self.members += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

// =============================================================================
// In memory
// =============================================================================

/// A document held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocument {
    pub name: String,
    pub header: DocumentHeader,
    pub members: Vec<DocumentMember>,
}

impl MemoryDocument {
    pub fn new(name: impl Into<String>, header: DocumentHeader) -> Self {
        Self {
            name: name.into(),
            header,
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: DocumentMember) -> Self {
        self.members.push(member);
        self
    }
}

struct MemoryReader<'a> {
    members: std::slice::Iter<'a, DocumentMember>,
    filter: MemberFilter,
}

impl FeatureReader for MemoryReader<'_> {
    fn next_member(&mut self) -> Result<Option<DocumentMember>> {
        let filter = &self.filter;
        Ok(self.members.find(|m| filter.admits(m)).cloned())
    }
}

impl DocumentSource for MemoryDocument {
    fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> Result<DocumentHeader> {
        Ok(self.header.clone())
    }

    fn open(&self, filter: MemberFilter) -> Result<Box<dyn FeatureReader + '_>> {
        Ok(Box::new(MemoryReader {
            members: self.members.iter(),
            filter,
        }))
    }
}

/// Collects a written document in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    pub header: Option<DocumentHeader>,
    pub members: Vec<DocumentMember>,
    pub finished: bool,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn features(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.members.iter().filter_map(DocumentMember::as_feature)
    }

    pub fn appearances(&self) -> impl Iterator<Item = &AppearanceRecord> {
        self.members.iter().filter_map(|m| match m {
            DocumentMember::Appearance(a) => Some(a),
            DocumentMember::Feature(_) => None,
        })
    }

    /// Turns the written output into a readable document.
    pub fn into_document(self, name: impl Into<String>) -> MemoryDocument {
        MemoryDocument {
            name: name.into(),
            header: self.header.unwrap_or_default(),
            members: self.members,
        }
    }
}

impl FeatureWriter for MemoryWriter {
    fn write_header(&mut self, header: &DocumentHeader) -> Result<()> {
        self.header = Some(header.clone());
        Ok(())
    }

    fn write_member(&mut self, member: &DocumentMember) -> Result<()> {
        if self.finished {
            return Err(Error::Serialization("writer already finished".into()));
        }
        self.members.push(member.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
