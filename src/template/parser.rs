//! Template string parsing

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches `${path.to.key}` with optional inner whitespace. Path keys may
/// contain dashes and underscores (module and provider names do).
static REFERENCE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}").unwrap());

/// A parsed template string
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub raw: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    /// A `${...}` reference: the dotted path, split into keys, plus the raw
    /// expression text for error messages
    Reference {
        path: Vec<String>,
        raw: String,
    },
}

impl Template {
    /// Whether the template is a single reference with no surrounding text.
    /// Such references may resolve to non-string values.
    pub fn is_whole_reference(&self) -> bool {
        self.segments.len() == 1 && matches!(self.segments[0], Segment::Reference { .. })
    }

    /// All reference segments in order
    pub fn references(&self) -> impl Iterator<Item = (&[String], &str)> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Reference { path, raw } => Some((path.as_slice(), raw.as_str())),
            Segment::Literal(_) => None,
        })
    }

    pub fn has_references(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Reference { .. }))
    }
}

/// Parse a string into literal and reference segments
pub fn parse_template(input: &str) -> Template {
    let mut segments = Vec::new();
    let mut last_end = 0;

    for captures in REFERENCE_REGEX.captures_iter(input) {
        let whole = captures.get(0).unwrap();
        if whole.start() > last_end {
            segments.push(Segment::Literal(input[last_end..whole.start()].to_string()));
        }
        let path_text = captures.get(1).unwrap().as_str();
        segments.push(Segment::Reference {
            path: path_text.split('.').map(String::from).collect(),
            raw: whole.as_str().to_string(),
        });
        last_end = whole.end();
    }

    if last_end < input.len() {
        segments.push(Segment::Literal(input[last_end..].to_string()));
    }

    Template {
        raw: input.to_string(),
        segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_is_one_literal() {
        let t = parse_template("hello world");
        assert_eq!(t.segments, vec![Segment::Literal("hello world".into())]);
        assert!(!t.has_references());
    }

    #[test]
    fn whole_reference_detected() {
        let t = parse_template("${providers.test-a.outputs.foo}");
        assert!(t.is_whole_reference());
        let (path, raw) = t.references().next().unwrap();
        assert_eq!(
            path,
            ["providers", "test-a", "outputs", "foo"].map(String::from)
        );
        assert_eq!(raw, "${providers.test-a.outputs.foo}");
    }

    #[test]
    fn mixed_literals_and_references() {
        let t = parse_template("image: ${modules.api.version}-dev");
        assert_eq!(t.segments.len(), 3);
        assert!(!t.is_whole_reference());
        assert_eq!(t.segments[0], Segment::Literal("image: ".into()));
        assert_eq!(t.segments[2], Segment::Literal("-dev".into()));
    }

    #[test]
    fn inner_whitespace_tolerated() {
        let t = parse_template("${ variables.region }");
        assert!(t.is_whole_reference());
    }

    #[test]
    fn unterminated_brace_stays_literal() {
        let t = parse_template("${not.closed");
        assert_eq!(t.segments, vec![Segment::Literal("${not.closed".into())]);
    }
}
