// HTTP Range header parsing and resolution against an object size.

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
pub(crate) fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes=")?;
    let mut parts = rest.splitn(2, '-');
    let start_str = parts.next()?.trim();
    let end_str = parts.next()?.trim();

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        Some(ParsedRange::Suffix { len })
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end_inclusive = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().ok()?)
        };
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        })
    }
}

/// Turn an optional Range header into an inclusive interval of a `size`-byte object.
///
/// `Ok(None)` means no Range was sent and the whole object is wanted. A header
/// that is malformed, or names bytes past the end, is unsatisfiable.
pub fn resolve_range(header: Option<&str>, size: u64) -> GatewayResult<Option<(u64, u64)>> {
    let Some(value) = header else {
        return Ok(None);
    };
    let unsatisfiable = || GatewayError::RangeNotSatisfiable { size };

    let last = size.checked_sub(1).ok_or_else(unsatisfiable)?;
    let (from, until) = match parse_range_header(value).ok_or_else(unsatisfiable)? {
        ParsedRange::StartEnd {
            start,
            end_inclusive: Some(end),
        } => (start, end),
        ParsedRange::StartEnd {
            start,
            end_inclusive: None,
        } => (start, last),
        ParsedRange::Suffix { len } => (size - len.min(size), last),
    };

    if from > until || until > last {
        return Err(unsatisfiable());
    }
    Ok(Some((from, until)))
}
