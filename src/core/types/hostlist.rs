// src/core/types/hostlist.rs

//! Hostlist expressions: `n[1-4,7],gpu[01-02],login1`.
//!
//! Used by partition and exclusion configuration, script arguments, and the
//! resume JSON document. Numeric ranges preserve zero padding.

use crate::core::errors::LodestarError;

/// Expands a hostlist expression into individual node names.
///
/// Duplicates are preserved in input order; the caller decides whether they
/// matter. Malformed brackets or ranges reject the whole expression.
pub fn expand(expr: &str) -> Result<Vec<String>, LodestarError> {
    let mut out = Vec::new();
    for part in split_outside_brackets(expr)? {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        expand_single(part, &mut out)?;
    }
    Ok(out)
}

/// Compresses a list of node names into a hostlist expression.
///
/// Names sharing a prefix and a numeric suffix of equal width collapse into
/// bracketed ranges; everything else is emitted verbatim.
pub fn compress(names: &[String]) -> String {
    // Group by (prefix, digit width), keeping first-seen group order.
    let mut groups: Vec<(String, usize, Vec<u64>)> = Vec::new();
    let mut singles: Vec<(usize, String)> = Vec::new();

    for (pos, name) in names.iter().enumerate() {
        match split_numeric_suffix(name) {
            Some((prefix, digits)) => {
                let width = digits.len();
                let value: u64 = digits.parse().unwrap_or(0);
                if let Some(entry) = groups
                    .iter_mut()
                    .find(|(p, w, _)| p == prefix && *w == width)
                {
                    entry.2.push(value);
                } else {
                    groups.push((prefix.to_string(), width, vec![value]));
                }
            }
            None => singles.push((pos, name.clone())),
        }
    }

    let mut parts = Vec::new();
    for (prefix, width, mut values) in groups {
        values.sort_unstable();
        values.dedup();
        if values.len() == 1 {
            parts.push(format!("{prefix}{:0width$}", values[0], width = width));
            continue;
        }
        let mut ranges = Vec::new();
        let mut start = values[0];
        let mut prev = values[0];
        for &v in &values[1..] {
            if v == prev + 1 {
                prev = v;
                continue;
            }
            ranges.push(format_range(start, prev, width));
            start = v;
            prev = v;
        }
        ranges.push(format_range(start, prev, width));
        parts.push(format!("{prefix}[{}]", ranges.join(",")));
    }
    for (_, name) in singles {
        parts.push(name);
    }
    parts.join(",")
}

fn format_range(start: u64, end: u64, width: usize) -> String {
    if start == end {
        format!("{start:0width$}")
    } else {
        format!("{start:0width$}-{end:0width$}")
    }
}

fn split_numeric_suffix(name: &str) -> Option<(&str, &str)> {
    let digits_start = name
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()?
        .0;
    if digits_start == 0 {
        // A bare number is not a usable prefix.
        return None;
    }
    Some((&name[..digits_start], &name[digits_start..]))
}

/// Splits on commas that are not inside brackets.
fn split_outside_brackets(expr: &str) -> Result<Vec<&str>, LodestarError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| LodestarError::InvalidNodeName(expr.to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(LodestarError::InvalidNodeName(expr.to_string()));
    }
    parts.push(&expr[start..]);
    Ok(parts)
}

fn expand_single(part: &str, out: &mut Vec<String>) -> Result<(), LodestarError> {
    let Some(open) = part.find('[') else {
        if part.contains(']') {
            return Err(LodestarError::InvalidNodeName(part.to_string()));
        }
        out.push(part.to_string());
        return Ok(());
    };
    let close = part
        .rfind(']')
        .ok_or_else(|| LodestarError::InvalidNodeName(part.to_string()))?;
    if close != part.len() - 1 || close <= open {
        return Err(LodestarError::InvalidNodeName(part.to_string()));
    }
    let prefix = &part[..open];
    let body = &part[open + 1..close];
    if body.is_empty() {
        return Err(LodestarError::InvalidNodeName(part.to_string()));
    }

    for item in body.split(',') {
        let item = item.trim();
        let (lo, hi) = match item.split_once('-') {
            Some((lo, hi)) => (lo, hi),
            None => (item, item),
        };
        if lo.is_empty() || hi.is_empty() || !is_digits(lo) || !is_digits(hi) {
            return Err(LodestarError::InvalidNodeName(part.to_string()));
        }
        let width = lo.len();
        let lo_v: u64 = lo
            .parse()
            .map_err(|_| LodestarError::InvalidNodeName(part.to_string()))?;
        let hi_v: u64 = hi
            .parse()
            .map_err(|_| LodestarError::InvalidNodeName(part.to_string()))?;
        if hi_v < lo_v {
            return Err(LodestarError::InvalidNodeName(part.to_string()));
        }
        for v in lo_v..=hi_v {
            out.push(format!("{prefix}{v:0width$}"));
        }
    }
    Ok(())
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}
