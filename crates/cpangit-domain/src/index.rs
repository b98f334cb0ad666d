//! Parser and serializer for the `02packages.details.txt` package index.
//!
//! The reader tolerates any header ordering and unknown headers; the writer
//! emits the fixed PAUSE-compatible header set with a recomputed line count
//! and a fresh timestamp. Rows are serialized in ASCII order by module name,
//! with the two-space separator downstream CPAN clients expect.

use std::collections::BTreeMap;

use thiserror::Error;
use time::{format_description, OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

pub const DEFAULT_URL: &str = "http://www.perl.com/CPAN/modules/02packages.details.txt";

/// Header lines emitted before the first row (plus the blank separator).
const HEADER_LINE_COUNT: usize = 9;

const LAST_UPDATED_FORMAT: &str =
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("package index is not valid utf-8")]
    NotUtf8,
    #[error("missing blank line after headers")]
    MissingBlankLine,
    #[error("malformed package index row at byte {offset}")]
    Malformed { offset: usize },
}

/// One index row: a module claimed by a distribution. A `None` version
/// encodes the literal `undef` token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageRow {
    pub module: String,
    pub version: Option<String>,
    pub dist_path: String,
}

/// The parsed package index: preserved headers plus the authoritative
/// module-to-row mapping and a derived dist-to-modules view over it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageIndex {
    headers: Vec<(String, String)>,
    rows: BTreeMap<String, PackageRow>,
    dists: BTreeMap<String, Vec<String>>,
}

impl PackageIndex {
    pub fn parse(bytes: &[u8]) -> Result<Self, IndexError> {
        let text = std::str::from_utf8(bytes).map_err(|_| IndexError::NotUtf8)?;
        let mut index = Self::default();
        let mut pos = 0usize;

        // Header phase, terminated by exactly one blank line.
        loop {
            let rest = &text[pos..];
            let Some(newline) = rest.find('\n') else {
                return Err(IndexError::MissingBlankLine);
            };
            let line = &rest[..newline];
            if line.is_empty() {
                pos += 1;
                break;
            }
            let Some((key, value)) = parse_header(line) else {
                return Err(IndexError::MissingBlankLine);
            };
            index.headers.push((key.to_string(), value.to_string()));
            pos += newline + 1;
        }

        // Body phase: `module version dist_path` rows until end of input.
        while pos < text.len() {
            let rest = &text[pos..];
            let Some(newline) = rest.find('\n') else {
                return Err(IndexError::Malformed { offset: pos });
            };
            let line = &rest[..newline];
            index.assign(parse_row(line).ok_or(IndexError::Malformed { offset: pos })?);
            pos += newline + 1;
        }

        Ok(index)
    }

    /// Serialize with the canonical header set, a recomputed `Line-Count`,
    /// and a fresh `Last-Updated` stamp.
    #[must_use]
    pub fn serialize(&self, canonical_url: Option<&str>) -> Vec<u8> {
        self.serialize_at(canonical_url, OffsetDateTime::now_utc())
    }

    #[must_use]
    pub fn serialize_at(&self, canonical_url: Option<&str>, now: OffsetDateTime) -> Vec<u8> {
        let url = canonical_url
            .or_else(|| self.header("URL"))
            .unwrap_or(DEFAULT_URL);
        let mut out = String::new();
        push_header(&mut out, "File", "02packages.details.txt");
        push_header(&mut out, "URL", url);
        push_header(
            &mut out,
            "Description",
            "Package names found in directory $CPAN/authors/id/",
        );
        push_header(&mut out, "Columns", "package name, version, path");
        push_header(
            &mut out,
            "Intended-For",
            "Automated fetch routines, namespace documentation.",
        );
        push_header(&mut out, "Written-By", "PAUSE version 1.005");
        push_header(
            &mut out,
            "Line-Count",
            &(HEADER_LINE_COUNT + self.rows.len()).to_string(),
        );
        push_header(&mut out, "Last-Updated", &format_last_updated(now));
        out.push('\n');
        for row in self.rows.values() {
            out.push_str(&row.module);
            out.push(' ');
            out.push_str(row.version.as_deref().unwrap_or("undef"));
            out.push_str("  ");
            out.push_str(&row.dist_path);
            out.push('\n');
        }
        out.into_bytes()
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match self.headers.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// The `Last-Updated` stamp, or `None` when absent or unparseable
    /// (callers treat unknown as infinitely stale).
    #[must_use]
    pub fn last_updated(&self) -> Option<OffsetDateTime> {
        scan_last_updated_value(self.header("Last-Updated")?)
    }

    #[must_use]
    pub fn row(&self, module: &str) -> Option<&PackageRow> {
        self.rows.get(module)
    }

    /// Every row currently claimed by `dist_path`, in claim order.
    #[must_use]
    pub fn rows_for_dist(&self, dist_path: &str) -> Vec<&PackageRow> {
        self.dists
            .get(dist_path)
            .map(|modules| {
                modules
                    .iter()
                    .filter_map(|module| self.rows.get(module))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rows(&self) -> impl Iterator<Item = &PackageRow> {
        self.rows.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert or overwrite the owner of `row.module`. Ownership is
    /// last-writer-wins: reassigning a module removes it from its previous
    /// dist's view. Assigning an identical row is a no-op.
    pub fn assign(&mut self, row: PackageRow) {
        if let Some(existing) = self.rows.get(&row.module) {
            if *existing == row {
                return;
            }
            if existing.dist_path != row.dist_path {
                if let Some(modules) = self.dists.get_mut(&existing.dist_path) {
                    modules.retain(|module| module != &row.module);
                    if modules.is_empty() {
                        self.dists.remove(&existing.dist_path);
                    }
                }
            }
        }
        let modules = self.dists.entry(row.dist_path.clone()).or_default();
        if !modules.iter().any(|module| module == &row.module) {
            modules.push(row.module.clone());
        }
        self.rows.insert(row.module.clone(), row);
    }

    pub fn remove(&mut self, module: &str) -> Option<PackageRow> {
        let row = self.rows.remove(module)?;
        if let Some(modules) = self.dists.get_mut(&row.dist_path) {
            modules.retain(|have| have != module);
            if modules.is_empty() {
                self.dists.remove(&row.dist_path);
            }
        }
        Some(row)
    }
}

/// Header-only scan for the `Last-Updated` stamp, for callers that need the
/// staleness decision without parsing the whole body.
#[must_use]
pub fn scan_last_updated(bytes: &[u8]) -> Option<OffsetDateTime> {
    let text = std::str::from_utf8(bytes).ok()?;
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = parse_header(line) {
            if key == "Last-Updated" {
                return scan_last_updated_value(value);
            }
        }
    }
    None
}

fn scan_last_updated_value(value: &str) -> Option<OffsetDateTime> {
    let format = match format_description::parse_borrowed::<2>(LAST_UPDATED_FORMAT) {
        Ok(format) => format,
        Err(err) => {
            warn!(error = %err, "invalid Last-Updated format description");
            return None;
        }
    };
    match PrimitiveDateTime::parse(value, &format) {
        Ok(stamp) => Some(stamp.assume_utc()),
        Err(err) => {
            warn!(value, error = %err, "unparseable Last-Updated header");
            None
        }
    }
}

fn format_last_updated(now: OffsetDateTime) -> String {
    let format = match format_description::parse_borrowed::<2>(LAST_UPDATED_FORMAT) {
        Ok(format) => format,
        Err(_) => return "unknown".to_string(),
    };
    now.to_offset(time::UtcOffset::UTC)
        .format(&format)
        .unwrap_or_else(|_| "unknown".to_string())
}

fn push_header(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("{:<13} {}\n", format!("{key}:"), value));
}

fn parse_header(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    let key = &line[..colon];
    let rest = &line[colon + 1..];
    if key.is_empty() || !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((key, rest.trim_start()))
}

fn parse_row(line: &str) -> Option<PackageRow> {
    if line.starts_with(char::is_whitespace) || line.ends_with(char::is_whitespace) {
        return None;
    }
    let mut fields = line.split_whitespace();
    let module = fields.next()?;
    let version = fields.next()?;
    let dist_path = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    Some(PackageRow {
        module: module.to_string(),
        version: match version {
            "undef" => None,
            other => Some(other.to_string()),
        },
        dist_path: dist_path.to_string(),
    })
}
