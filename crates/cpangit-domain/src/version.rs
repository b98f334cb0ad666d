//! CPAN version grammar: normalization, comparison, and requirement handling.
//!
//! Versions are stored as opaque strings everywhere else in the engine; this
//! module is the only place that interprets them. Comparison follows the CPAN
//! `version` semantics: underscores are stripped, `v`-prefixed or multi-dot
//! strings are numeric tuples, and plain decimal forms split their fraction
//! into three-digit groups (`1.1` and `1.100` are the same version).

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("malformed version requirement segment `{0}`")]
    Malformed(String),
    #[error("conflicting equality requirements `=={0}` and `=={1}`")]
    ConflictingEqualityReq(String, String),
}

/// Requirement operator. The declaration order is the canonical emission
/// order when a requirement is serialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Ne,
}

impl Op {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Ne => "!=",
        }
    }
}

impl TryFrom<&str> for Op {
    type Error = VersionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "==" => Ok(Self::Eq),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            "!=" => Ok(Self::Ne),
            other => Err(VersionError::Malformed(other.to_string())),
        }
    }
}

/// An ordered list of `(op, version)` clauses. The empty requirement is
/// satisfied by any version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionReq {
    clauses: Vec<(Op, String)>,
}

impl VersionReq {
    #[must_use]
    pub fn clauses(&self) -> &[(Op, String)] {
        &self.clauses
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The first clause, the one the resolver's core-perl allowance inspects.
    #[must_use]
    pub fn leading(&self) -> Option<(Op, &str)> {
        self.clauses
            .first()
            .map(|(op, version)| (*op, version.as_str()))
    }

    /// Whether `version` satisfies every clause. `None` encodes the literal
    /// `undef` version, whose empty tuple matches only `!=` clauses.
    #[must_use]
    pub fn matches(&self, version: Option<&str>) -> bool {
        self.clauses
            .iter()
            .all(|(op, want)| clause_holds(*op, version, want))
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, (op, version)) in self.clauses.iter().enumerate() {
            if pos > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}{}", op.as_str(), version)?;
        }
        Ok(())
    }
}

/// Parse a requirement specification: comma-separated clauses, each an
/// optional operator followed by a version token. A missing operator means
/// `>=`; an empty or whitespace-only spec is the empty requirement.
pub fn parse_requirement(spec: &str) -> Result<VersionReq, VersionError> {
    if spec.trim().is_empty() {
        return Ok(VersionReq::default());
    }
    let mut clauses = Vec::new();
    for segment in spec.split(',') {
        clauses.push(parse_clause(segment)?);
    }
    Ok(VersionReq { clauses })
}

fn parse_clause(segment: &str) -> Result<(Op, String), VersionError> {
    let segment = segment.trim();
    let (op, rest) = if let Some(rest) = segment.strip_prefix("<=") {
        (Op::Le, rest)
    } else if let Some(rest) = segment.strip_prefix(">=") {
        (Op::Ge, rest)
    } else if let Some(rest) = segment.strip_prefix("==") {
        (Op::Eq, rest)
    } else if let Some(rest) = segment.strip_prefix("!=") {
        (Op::Ne, rest)
    } else if let Some(rest) = segment.strip_prefix('<') {
        (Op::Lt, rest)
    } else if let Some(rest) = segment.strip_prefix('>') {
        (Op::Gt, rest)
    } else {
        (Op::Ge, segment)
    };
    let version = rest.trim();
    if !is_version_token(version) {
        return Err(VersionError::Malformed(segment.to_string()));
    }
    Ok((op, version.to_string()))
}

fn is_version_token(token: &str) -> bool {
    let body = token.strip_prefix('v').unwrap_or(token);
    let mut chars = body.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_digit())
        && chars.all(|ch| ch.is_ascii_digit() || ch == '.' || ch == '_')
}

/// Combine several requirement specifications into one. Per operator the
/// strongest constraint survives (`!=` clauses union); an `==` clause
/// subsumes everything else, and two distinct equalities conflict.
pub fn combine<I, S>(specs: I) -> Result<VersionReq, VersionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut equality: Option<String> = None;
    let mut strongest: Vec<(Op, String)> = Vec::new();
    let mut exclusions: Vec<String> = Vec::new();

    for spec in specs {
        for (op, version) in parse_requirement(spec.as_ref())?.clauses {
            match op {
                Op::Eq => match &equality {
                    Some(existing) if compare(existing, &version) != Ordering::Equal => {
                        return Err(VersionError::ConflictingEqualityReq(
                            existing.clone(),
                            version,
                        ));
                    }
                    Some(_) => {}
                    None => equality = Some(version),
                },
                Op::Ne => {
                    if !exclusions
                        .iter()
                        .any(|have| compare(have, &version) == Ordering::Equal)
                    {
                        exclusions.push(version);
                    }
                }
                Op::Gt | Op::Ge => retain_strongest(&mut strongest, op, version, Ordering::Greater),
                Op::Lt | Op::Le => retain_strongest(&mut strongest, op, version, Ordering::Less),
            }
        }
    }

    if let Some(version) = equality {
        return Ok(VersionReq {
            clauses: vec![(Op::Eq, version)],
        });
    }

    strongest.sort_by_key(|(op, _)| *op);
    exclusions.sort_by(|a, b| compare(a, b));
    let mut clauses = strongest;
    clauses.extend(exclusions.into_iter().map(|version| (Op::Ne, version)));
    Ok(VersionReq { clauses })
}

fn retain_strongest(clauses: &mut Vec<(Op, String)>, op: Op, version: String, wins: Ordering) {
    match clauses.iter_mut().find(|(have, _)| *have == op) {
        Some((_, existing)) => {
            if compare(&version, existing) == wins {
                *existing = version;
            }
        }
        None => clauses.push((op, version)),
    }
}

/// Compare two version strings under CPAN semantics.
#[must_use]
pub fn compare(a: &str, b: &str) -> Ordering {
    cmp_tuples(&normalize(a), &normalize(b))
}

fn clause_holds(op: Op, have: Option<&str>, want: &str) -> bool {
    let have = have.map(normalize).unwrap_or_default();
    if have.is_empty() {
        // The undef version never orders against anything and never equals.
        return op == Op::Ne;
    }
    let ordering = cmp_tuples(&have, &normalize(want));
    match op {
        Op::Eq => ordering == Ordering::Equal,
        Op::Ne => ordering != Ordering::Equal,
        Op::Gt => ordering == Ordering::Greater,
        Op::Ge => ordering != Ordering::Less,
        Op::Lt => ordering == Ordering::Less,
        Op::Le => ordering != Ordering::Greater,
    }
}

fn cmp_tuples(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for pos in 0..len {
        let left = a.get(pos).copied().unwrap_or(0);
        let right = b.get(pos).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Normalize a raw version string to its numeric tuple. Unparseable
/// components collapse to zero rather than failing; index rows carry
/// whatever authors uploaded.
fn normalize(raw: &str) -> Vec<u64> {
    let cleaned: String = raw.trim().chars().filter(|ch| *ch != '_').collect();
    let (explicit_v, body) = match cleaned.strip_prefix('v') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };
    if body.is_empty() {
        return Vec::new();
    }
    if explicit_v || body.matches('.').count() >= 2 {
        return body
            .split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect();
    }
    // Decimal form: the fraction is read in three-digit groups, right-padded.
    let mut split = body.splitn(2, '.');
    let integer = split.next().unwrap_or("0");
    let mut parts = vec![integer.parse::<u64>().unwrap_or(0)];
    if let Some(fraction) = split.next() {
        let digits: Vec<char> = fraction.chars().collect();
        for chunk in digits.chunks(3) {
            let mut group: String = chunk.iter().collect();
            while group.len() < 3 {
                group.push('0');
            }
            parts.push(group.parse::<u64>().unwrap_or(0));
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clauses(spec: &str) -> Vec<(Op, String)> {
        parse_requirement(spec)
            .expect("requirement should parse")
            .clauses
    }

    #[test]
    fn parses_bare_versions_as_at_least() {
        assert_eq!(clauses("1"), vec![(Op::Ge, "1".to_string())]);
        assert_eq!(clauses("1.1"), vec![(Op::Ge, "1.1".to_string())]);
        assert_eq!(clauses("1.01_01"), vec![(Op::Ge, "1.01_01".to_string())]);
    }

    #[test]
    fn parses_explicit_operators() {
        assert_eq!(clauses(">1"), vec![(Op::Gt, "1".to_string())]);
        assert_eq!(clauses("<2"), vec![(Op::Lt, "2".to_string())]);
        assert_eq!(
            clauses("==20200101.1"),
            vec![(Op::Eq, "20200101.1".to_string())]
        );
    }

    #[test]
    fn parses_multi_clause_requirements_in_order() {
        assert_eq!(
            clauses(">2,!=2.002,!=2.004"),
            vec![
                (Op::Gt, "2".to_string()),
                (Op::Ne, "2.002".to_string()),
                (Op::Ne, "2.004".to_string()),
            ]
        );
    }

    #[test]
    fn empty_spec_is_the_empty_requirement() {
        assert!(parse_requirement("").expect("parse").is_empty());
        assert!(parse_requirement("   ").expect("parse").is_empty());
        assert!(parse_requirement("").expect("parse").matches(Some("0.01")));
        assert!(parse_requirement("").expect("parse").matches(None));
    }

    #[test]
    fn rejects_malformed_segments() {
        assert!(matches!(
            parse_requirement("one"),
            Err(VersionError::Malformed(_))
        ));
        assert!(matches!(
            parse_requirement(">=1,"),
            Err(VersionError::Malformed(_))
        ));
        assert!(matches!(
            parse_requirement("~1.2"),
            Err(VersionError::Malformed(_))
        ));
    }

    #[test]
    fn combine_keeps_the_strongest_lower_bound() {
        let combined = combine([">1,>2"]).expect("combine");
        assert_eq!(combined.clauses(), &[(Op::Gt, "2".to_string())]);

        let combined = combine([">=10.1,>=4.5,6"]).expect("combine");
        assert_eq!(combined.clauses(), &[(Op::Ge, "10.1".to_string())]);
    }

    #[test]
    fn combine_lets_equality_subsume_bounds() {
        let combined = combine(["==5.01_01,5,>4"]).expect("combine");
        assert_eq!(combined.clauses(), &[(Op::Eq, "5.01_01".to_string())]);
    }

    #[test]
    fn combine_rejects_conflicting_equalities() {
        let err = combine(["==1.0", "==2.0"]).unwrap_err();
        assert!(matches!(err, VersionError::ConflictingEqualityReq(..)));
    }

    #[test]
    fn combine_of_one_spec_canonicalizes_it() {
        let combined = combine([">2,!=2.004,!=2.002"]).expect("combine");
        assert_eq!(combined.to_string(), ">2,!=2.002,!=2.004");

        let reparsed = parse_requirement(&combined.to_string()).expect("reparse");
        assert_eq!(reparsed, combined);
    }

    #[test]
    fn decimal_versions_compare_by_three_digit_groups() {
        assert_eq!(compare("1.1", "1.100"), Ordering::Equal);
        assert_eq!(compare("1.1", "1.02"), Ordering::Greater);
        assert_eq!(compare("5.01_01", "5.0101"), Ordering::Equal);
        assert_eq!(compare("v1.2.3", "1.002.003"), Ordering::Equal);
        assert_eq!(compare("10.1", "6"), Ordering::Greater);
    }

    #[test]
    fn undef_matches_only_not_equal() {
        let ge = parse_requirement(">=1").expect("parse");
        assert!(!ge.matches(None));
        let ne = parse_requirement("!=1").expect("parse");
        assert!(ne.matches(None));
        let eq = parse_requirement("==1").expect("parse");
        assert!(!eq.matches(None));
    }

    #[test]
    fn matches_honours_every_clause() {
        let req = parse_requirement(">2,!=2.002,!=2.004").expect("parse");
        assert!(req.matches(Some("2.003")));
        assert!(!req.matches(Some("2.002")));
        assert!(!req.matches(Some("2.004")));
        assert!(!req.matches(Some("2")));
    }
}
