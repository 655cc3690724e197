//! Sidecar metadata parsing for work items.
//!
//! An optional `info.txt` next to the media asset supplies the title,
//! description and tags. The file is a line-oriented grammar of three
//! sections introduced by header keywords; anything unreadable falls back to
//! defaults with a logged diagnostic.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scan::sorted_files;

/// Sidecar file name, matched case-insensitively.
pub const SIDECAR_FILE_NAME: &str = "info.txt";

/// Sample sidecar written for operators.
pub const SIDECAR_TEMPLATE: &str = "Title:
Your video title goes here (100 characters at most)

Description:
This is the description.
It can span several lines.
Links and special characters are kept as written.

Tags:
first tag
,second tag
,third tag
";

/// Title, description and tags of a work item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    /// Ordered, de-duplicated, never contains empty entries.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Title,
    Description,
    Tags,
}

/// Recognized header spellings, lower-cased. The first entry found in a
/// line decides the section.
const SECTION_HEADERS: &[(&str, Section)] = &[
    ("thẻ tag video:", Section::Tags),
    ("thẻ tag:", Section::Tags),
    ("tiêu đề:", Section::Title),
    ("giới thiệu:", Section::Description),
    ("mô tả:", Section::Description),
    ("title:", Section::Title),
    ("description:", Section::Description),
    ("tags:", Section::Tags),
    ("tag:", Section::Tags),
];

/// Case-insensitive search for `needle` (already lower-case) in `line`.
///
/// A match must not continue a word, so `subtitle:` never matches `title:`.
/// Returns the byte range of the match in `line`.
fn find_header(line: &str, needle: &str) -> Option<(usize, usize)> {
    let mut previous: Option<char> = None;
    for (start, first) in line.char_indices() {
        let continues_word = previous.is_some_and(char::is_alphanumeric);
        previous = Some(first);
        if continues_word {
            continue;
        }

        let mut hay = line[start..].char_indices();
        let mut end = start;
        let mut matched = true;
        for expected in needle.chars() {
            match hay.next() {
                Some((offset, c)) if c.to_lowercase().eq(expected.to_lowercase()) => {
                    end = start + offset + c.len_utf8();
                }
                _ => {
                    matched = false;
                    break;
                }
            }
        }
        if matched {
            return Some((start, end));
        }
    }
    None
}

/// Looks a line up in the header table.
///
/// Returns the section and the text trailing the header on the same line.
fn match_header(line: &str) -> Option<(Section, &str)> {
    SECTION_HEADERS.iter().find_map(|(needle, section)| {
        find_header(line, needle).map(|(_, end)| (*section, &line[end..]))
    })
}

/// Drops leading and trailing whitespace-only lines, keeping inner ones.
fn trim_blank_lines(lines: &[String]) -> String {
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

/// Joins tag lines, splits on commas and keeps the first occurrence of
/// each non-empty, trimmed tag.
fn collect_tags(lines: &[String]) -> Vec<String> {
    let combined = lines.join(",");
    let mut tags: Vec<String> = Vec::new();
    for tag in combined.split(',').map(str::trim) {
        if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// Parses sidecar text.
///
/// `default_title` is used when the title section is missing or empty.
pub fn parse_sidecar_text(text: &str, default_title: &str) -> VideoMetadata {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut current: Option<Section> = None;
    let mut title_lines: Vec<String> = Vec::new();
    let mut description_lines: Vec<String> = Vec::new();
    let mut tag_lines: Vec<String> = Vec::new();

    for line in text.lines() {
        if let Some((section, rest)) = match_header(line) {
            current = Some(section);
            let rest = rest.trim();
            if !rest.is_empty() {
                match section {
                    Section::Title => title_lines.push(rest.to_string()),
                    Section::Description => description_lines.push(rest.to_string()),
                    Section::Tags => tag_lines.push(rest.to_string()),
                }
            }
            continue;
        }

        let trimmed = line.trim();
        match current {
            Some(Section::Title) if !trimmed.is_empty() => title_lines.push(trimmed.to_string()),
            Some(Section::Description) => description_lines.push(line.trim_end().to_string()),
            Some(Section::Tags) if !trimmed.is_empty() => tag_lines.push(trimmed.to_string()),
            _ => {}
        }
    }

    let title = if title_lines.is_empty() {
        default_title.to_string()
    } else {
        title_lines.join(" ")
    };

    VideoMetadata {
        title,
        description: trim_blank_lines(&description_lines),
        tags: collect_tags(&tag_lines),
    }
}

/// Media file name without its extension.
fn default_title(media_asset_name: &str) -> String {
    Path::new(media_asset_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| media_asset_name.to_string())
}

/// Locates the sidecar file of a folder, if any.
pub fn find_sidecar_file(folder: &Path) -> io::Result<Option<PathBuf>> {
    Ok(sorted_files(folder)?.into_iter().find(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.eq_ignore_ascii_case(SIDECAR_FILE_NAME))
    }))
}

/// Reads the metadata of a work item folder.
///
/// Defaults are the media asset's base name as title, an empty description
/// and no tags. A missing, unreadable or non-UTF-8 sidecar never fails:
/// defaults apply and a warning is logged.
pub fn parse_metadata(folder: &Path, media_asset_name: &str) -> VideoMetadata {
    let fallback = default_title(media_asset_name);
    let defaults = VideoMetadata {
        title: fallback.clone(),
        ..VideoMetadata::default()
    };

    let sidecar = match find_sidecar_file(folder) {
        Ok(Some(path)) => path,
        Ok(None) => {
            debug!(folder = %folder.display(), "no sidecar, using defaults");
            return defaults;
        }
        Err(e) => {
            warn!(folder = %folder.display(), error = %e, "sidecar lookup failed, using defaults");
            return defaults;
        }
    };

    let bytes = match std::fs::read(&sidecar) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(sidecar = %sidecar.display(), error = %e, "sidecar unreadable, using defaults");
            return defaults;
        }
    };

    match String::from_utf8(bytes) {
        Ok(text) => parse_sidecar_text(&text, &fallback),
        Err(e) => {
            warn!(sidecar = %sidecar.display(), error = %e, "sidecar is not UTF-8, using defaults");
            defaults
        }
    }
}

/// Writes [`SIDECAR_TEMPLATE`] to `path`. Never overwrites an existing file.
pub fn write_sidecar_template(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(SIDECAR_TEMPLATE.as_bytes())?;
    Ok(())
}
