//! MLSD / LIST response parser.
//!
//! Two grammars:
//! 1. **Structured** (RFC 3659 MLSD): `type=file;size=1234;modify=20260101120000; file.txt`
//! 2. **Legacy** (LIST), either Unix `ls -l`:
//!    `-rw-r--r--   1 owner group  1234 Jan  1 12:00 file.txt`
//!    or Windows/IIS: `01-01-26  12:00AM       1234 file.txt`
//!
//! A line that cannot be read is dropped; a body in which no line can be
//! read is a `Parse` error. Output is always sorted with directories first,
//! then by name ignoring case.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{EntryKind, RemoteEntry, RemoteTimestamp};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_PERMS: Regex = Regex::new(r"^[-dlbcps][-rwxsStTlL]{9}[.+@]?$").unwrap();
    static ref DOS_LINE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+               # date
        (\d{1,2}:\d{2}\s*(?:[AaPp][Mm])?)\s+    # time
        (<DIR>|\d+)\s+                          # size or <DIR>
        (.+)$                                   # name
        "
    )
    .unwrap();
}

/// Tokens before the name in a Unix listing line.
const UNIX_FIELDS: usize = 8;

// ─── Structured (MLSD) ───────────────────────────────────────────────

/// Parse an MLSD body.
pub fn parse_structured(body: &str) -> FtpResult<Vec<RemoteEntry>> {
    parse_body(body, "MLSD", parse_mlsd_line)
}

enum Line {
    Entry(RemoteEntry),
    /// Recognised, but not an entry (`cdir`, `pdir`, `total 12`, ...).
    Skip,
    Unrecognised,
}

fn parse_mlsd_line(line: &str) -> Line {
    let Some((facts, name)) = line.split_once(' ') else {
        return Line::Unrecognised;
    };
    if name.is_empty() || !facts.contains('=') {
        return Line::Unrecognised;
    }

    let mut kind = EntryKind::File;
    let mut size = 0;
    let mut modified = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => match value.to_ascii_lowercase().as_str() {
                "cdir" | "pdir" => return Line::Skip,
                "dir" => kind = EntryKind::Directory,
                _ => kind = EntryKind::File,
            },
            "size" | "sizd" => size = value.parse().unwrap_or(0),
            "modify" => modified = Some(parse_mlsd_time(value)),
            _ => {}
        }
    }

    if name == "." || name == ".." {
        return Line::Skip;
    }
    Line::Entry(RemoteEntry {
        name: name.to_string(),
        kind,
        size: if kind == EntryKind::Directory { 0 } else { size },
        modified,
    })
}

/// `YYYYMMDDHHMMSS[.fff]`; anything else is kept verbatim.
fn parse_mlsd_time(value: &str) -> RemoteTimestamp {
    let base = value.split('.').next().unwrap_or(value);
    if base.len() == 14 && base.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(dt) = NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S") {
            return RemoteTimestamp::Parsed(Utc.from_utc_datetime(&dt));
        }
    }
    RemoteTimestamp::Raw(value.to_string())
}

// ─── Legacy (LIST) ───────────────────────────────────────────────────

/// Parse a LIST body (Unix or Windows/IIS style, line by line).
pub fn parse_legacy(body: &str) -> FtpResult<Vec<RemoteEntry>> {
    parse_body(body, "LIST", |line| match parse_unix_line(line) {
        Line::Unrecognised => parse_dos_line(line),
        other => other,
    })
}

/// ```text
/// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
/// -rw-r--r--   1 user group  1234 Jan  1  2025 my file.txt
/// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
/// ```
fn parse_unix_line(line: &str) -> Line {
    if line.starts_with("total ") {
        return Line::Skip;
    }
    let Some((fields, rest)) = split_fields(line, UNIX_FIELDS) else {
        return Line::Unrecognised;
    };
    if !UNIX_PERMS.is_match(fields[0]) {
        return Line::Unrecognised;
    }
    let Ok(size) = fields[4].parse::<u64>() else {
        return Line::Unrecognised;
    };

    let (kind, name) = match fields[0].as_bytes()[0] {
        b'd' => (EntryKind::Directory, rest),
        b'l' => (
            EntryKind::Symlink,
            rest.split_once(" -> ").map(|(n, _)| n).unwrap_or(rest),
        ),
        _ => (EntryKind::File, rest),
    };
    if name == "." || name == ".." {
        return Line::Skip;
    }

    Line::Entry(RemoteEntry {
        name: name.to_string(),
        kind,
        size: if kind == EntryKind::Directory { 0 } else { size },
        modified: Some(parse_unix_date(fields[5], fields[6], fields[7])),
    })
}

/// `Jan 1 2025` is a full date; `Jan 1 12:00` has no year and stays raw.
fn parse_unix_date(month: &str, day: &str, year_or_time: &str) -> RemoteTimestamp {
    let text = format!("{} {} {}", month, day, year_or_time);
    if year_or_time.len() == 4 && year_or_time.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(date) = NaiveDate::parse_from_str(&text, "%b %d %Y") {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return RemoteTimestamp::Parsed(Utc.from_utc_datetime(&dt));
            }
        }
    }
    RemoteTimestamp::Raw(text)
}

/// ```text
/// 01-01-26  12:00AM       1234 file.txt
/// 01-01-26  12:00PM      <DIR> Directory Name
/// ```
fn parse_dos_line(line: &str) -> Line {
    let Some(caps) = DOS_LINE.captures(line) else {
        return Line::Unrecognised;
    };
    let (date, time, size, name) = (&caps[1], &caps[2], &caps[3], &caps[4]);
    if name == "." || name == ".." {
        return Line::Skip;
    }

    let (kind, size) = if size == "<DIR>" {
        (EntryKind::Directory, 0)
    } else {
        match size.parse::<u64>() {
            Ok(n) => (EntryKind::File, n),
            Err(_) => return Line::Unrecognised,
        }
    };

    Line::Entry(RemoteEntry {
        name: name.to_string(),
        kind,
        size,
        modified: Some(parse_dos_date(date, time)),
    })
}

fn parse_dos_date(date: &str, time: &str) -> RemoteTimestamp {
    let combined = format!("{} {}", date, time.replace(' ', "").to_uppercase());
    for fmt in ["%m-%d-%y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %I:%M%p", "%m-%d-%Y %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&combined, fmt) {
            return RemoteTimestamp::Parsed(Utc.from_utc_datetime(&dt));
        }
    }
    RemoteTimestamp::Raw(format!("{} {}", date, time))
}

/// First `n` whitespace-separated tokens plus the untouched remainder.
/// `None` when the line runs out before the remainder starts.
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while fields.len() < n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        None
    } else {
        Some((fields, rest))
    }
}

// ─── Shared ──────────────────────────────────────────────────────────

fn parse_body<F>(body: &str, grammar: &str, parse_line: F) -> FtpResult<Vec<RemoteEntry>>
where
    F: Fn(&str) -> Line,
{
    let mut entries = Vec::new();
    let mut seen = 0usize;
    let mut recognised = 0usize;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        seen += 1;
        match parse_line(line) {
            Line::Entry(e) => {
                recognised += 1;
                entries.push(e);
            }
            Line::Skip => recognised += 1,
            Line::Unrecognised => log::debug!("Skipping unreadable {} line: {}", grammar, line),
        }
    }

    if seen > 0 && recognised == 0 {
        return Err(FtpError::parse(format!(
            "No readable {} lines in a {}-line listing",
            grammar, seen
        )));
    }

    sort_entries(&mut entries);
    Ok(entries)
}

/// Directories first, then case-insensitive name, then exact name so that
/// the order never depends on the server's.
pub fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });
}
