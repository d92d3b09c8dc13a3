// SPDX-License-Identifier: Apache-2.0

//! Minimal `/proc/self/maps` parsing (§4.1 "Startup discovery").
//!
//! The driller only needs enough of each line to classify a mapping as the
//! heap, the stack, or something else, and to read its current protection —
//! it does not need the device/inode fields, so they are skipped rather than
//! validated.

use crate::error::{DrillerError, Result};
use xproc_core::Protection;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMapping {
    pub start: usize,
    pub end: usize,
    pub protection: Protection,
    pub offset: u64,
    pub pathname: Option<String>,
}

/// Parses the full contents of a `/proc/self/maps`-formatted file.
pub fn parse(contents: &str) -> Result<Vec<RawMapping>> {
    contents
        .lines()
        .enumerate()
        .map(|(i, line)| parse_line(i, line))
        .collect()
}

fn parse_line(line_no: usize, line: &str) -> Result<RawMapping> {
    let bad = || DrillerError::MapParse {
        line: line_no,
        text: line.to_string(),
    };

    let mut fields = line.splitn(6, ' ').filter(|f| !f.is_empty());
    let range = fields.next().ok_or_else(bad)?;
    let perms = fields.next().ok_or_else(bad)?;
    let offset = fields.next().ok_or_else(bad)?;
    let _dev = fields.next().ok_or_else(bad)?;
    let _inode = fields.next().ok_or_else(bad)?;
    let pathname = fields.next().map(|p| p.trim().to_string()).filter(|p| !p.is_empty());

    let (start_str, end_str) = range.split_once('-').ok_or_else(bad)?;
    let start = usize::from_str_radix(start_str, 16).map_err(|_| bad())?;
    let end = usize::from_str_radix(end_str, 16).map_err(|_| bad())?;

    let mut protection = Protection::empty();
    let perm_bytes = perms.as_bytes();
    if perm_bytes.first() == Some(&b'r') {
        protection |= Protection::READ;
    }
    if perm_bytes.get(1) == Some(&b'w') {
        protection |= Protection::WRITE;
    }
    if perm_bytes.get(2) == Some(&b'x') {
        protection |= Protection::EXEC;
    }

    let offset = u64::from_str_radix(offset, 16).map_err(|_| bad())?;

    Ok(RawMapping {
        start,
        end,
        protection,
        offset,
        pathname,
    })
}

impl RawMapping {
    pub fn is_heap(&self) -> bool {
        self.pathname.as_deref() == Some("[heap]")
    }

    pub fn is_stack(&self) -> bool {
        self.pathname.as_deref() == Some("[stack]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_heap_and_stack_lines() {
        let input = "\
5555aaaa0000-5555aaac1000 rw-p 00000000 00:00 0 [heap]
7ffe00000000-7ffe00021000 rw-p 00000000 00:00 0 [stack]
7f0000000000-7f0000200000 r-xp 00000000 08:01 131 /usr/lib/libc.so.6
";
        let mappings = parse(input).unwrap();
        assert_eq!(mappings.len(), 3);
        assert!(mappings[0].is_heap());
        assert!(mappings[1].is_stack());
        assert!(mappings[2].protection.contains(Protection::EXEC));
        assert!(!mappings[2].protection.contains(Protection::WRITE));
    }

    #[test]
    fn rejects_malformed_line() {
        let err = parse("not a maps line").unwrap_err();
        assert!(matches!(err, DrillerError::MapParse { line: 0, .. }));
    }
}
