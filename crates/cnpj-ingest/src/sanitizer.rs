//! Line sanitizer
//!
//! Repairs one delimited line into exactly `N` fields. Two corruption modes
//! show up in the published files:
//!
//! - stray quote characters and line terminators inside a record;
//! - extra `;` delimiters inside the free-text name (second) field, or
//!   truncated records with missing trailing fields.
//!
//! The repair is a heuristic. Surplus delimiters are always attributed to the
//! second field, so corruption anywhere else is misattributed silently; the
//! reader flags repaired lines whose key column no longer looks like a key.

/// Field delimiter of the source files
pub const DELIMITER: char = ';';

/// Replaces the surplus delimiters inside a merged field
///
/// The source format has no quoting, so a merged field cannot keep `;`.
pub const MERGE_SEPARATOR: &str = " ";

/// What the sanitizer had to do to reach the expected field count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Field count already matched
    Unchanged,
    /// `extra` surplus fields were folded into the second field
    Merged { extra: usize },
    /// `missing` empty fields were appended
    Padded { missing: usize },
}

impl Repair {
    pub fn is_repaired(self) -> bool {
        self != Repair::Unchanged
    }
}

/// A line with exactly the expected number of fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub line: String,
    pub repair: Repair,
}

/// Repair `raw` into exactly `expected` fields
///
/// Never fails. With `expected == 0` the line is returned cleaned but
/// otherwise untouched, since no field count can be honoured.
pub fn sanitize_line(raw: &str, expected: usize) -> String {
    sanitize(raw, expected).line
}

/// Repair `raw` into exactly `expected` fields and report the repair kind
pub fn sanitize(raw: &str, expected: usize) -> Sanitized {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '"' | '\r' | '\n'))
        .collect();

    let count = cleaned.split(DELIMITER).count();

    if expected == 0 || count == expected {
        return Sanitized {
            line: cleaned,
            repair: Repair::Unchanged,
        };
    }

    if count < expected {
        let missing = expected - count;
        let mut line = cleaned;
        line.extend(std::iter::repeat(DELIMITER).take(missing));
        return Sanitized {
            line,
            repair: Repair::Padded { missing },
        };
    }

    let extra = count - expected;
    Sanitized {
        line: merge_surplus(&cleaned, expected),
        repair: Repair::Merged { extra },
    }
}

/// Fold surplus fields into the second field
///
/// Keeps field 0 and the last `expected - 2` fields verbatim and joins the
/// fields in between with [`MERGE_SEPARATOR`]. With a single expected field
/// there is no split point left, so the whole line becomes that field.
fn merge_surplus(cleaned: &str, expected: usize) -> String {
    let fields: Vec<&str> = cleaned.split(DELIMITER).collect();

    if expected == 1 {
        return fields.join(MERGE_SEPARATOR);
    }

    let tail_len = expected - 2;
    let middle_end = fields.len() - tail_len;

    let mut out: Vec<String> = Vec::with_capacity(expected);
    out.push(fields[0].to_string());
    out.push(fields[1..middle_end].join(MERGE_SEPARATOR));
    out.extend(fields[middle_end..].iter().map(|f| f.to_string()));

    out.join(";")
}
