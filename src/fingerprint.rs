use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Alternate extension spellings and the canonical spelling they are rewritten to.
const EXTENSION_ALIASES: &[(&str, &str)] = &[("jpeg", "jpg")];

/// Extensions recognised as items when walking a local tree.
pub const ITEM_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "tiff"];

const UNIT_DIR_PREFIX: &str = "chapter-";
const ITEM_FILE_PREFIX: &str = "panel-";

/// Slash-separated remote key of an item with its extension normalized, so
/// `a/b/panel-001.jpeg` and `a/b/panel-001.jpg` are the same item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Remote key of one item: `<prefix>/<collection>/chapter-NNN/panel-NNN.<ext>`.
    pub fn for_item(remote_prefix: &str, collection: &str, unit: u32, position: u32, ext: &str) -> Self {
        canonicalize(&format!(
            "{}/{}/{}/{}",
            remote_prefix,
            collection,
            unit_dir_name(unit),
            item_file_name(position, ext)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx + 1..]),
        }
    }

    /// Folder holding the item, if the key has one.
    pub fn parent(&self) -> Option<&str> {
        self.0.rfind('/').map(|idx| &self.0[..idx])
    }

    /// Every ancestor folder of the item, shortest first.
    pub fn containers(&self) -> Vec<&str> {
        let Some(parent) = self.parent() else {
            return Vec::new();
        };
        parent
            .match_indices('/')
            .map(|(idx, _)| &parent[..idx])
            .chain(std::iter::once(parent))
            .collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalize a local or remote path into a fingerprint.
///
/// Separators become `/`, empty segments are dropped and the extension is normalized.
/// Applying it to its own output changes nothing.
pub fn canonicalize(path: &str) -> Fingerprint {
    let joined = path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    Fingerprint(normalize_extension(&joined))
}

/// Rewrite an aliased extension (matched case-insensitively) to its canonical spelling.
/// Any other extension passes through untouched.
pub fn normalize_extension(path: &str) -> String {
    let name_start = path.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    if let Some(dot) = path[name_start..].rfind('.') {
        let dot = name_start + dot;
        let ext = &path[dot + 1..];
        for (alias, canonical) in EXTENSION_ALIASES {
            if ext.eq_ignore_ascii_case(alias) {
                return format!("{}.{}", &path[..dot], canonical);
            }
        }
    }
    path.to_string()
}

pub fn unit_dir_name(unit: u32) -> String {
    format!("{}{:03}", UNIT_DIR_PREFIX, unit)
}

pub fn item_file_name(position: u32, ext: &str) -> String {
    format!("{}{:03}.{}", ITEM_FILE_PREFIX, position, ext.trim_start_matches('.'))
}

/// Unit key of a `chapter-NNN` folder name.
pub fn parse_unit_dir(name: &str) -> Option<u32> {
    leading_number(name.strip_prefix(UNIT_DIR_PREFIX)?)
}

/// Item position of a `panel-NNN.ext` file name.
pub fn parse_item_position(name: &str) -> Option<u32> {
    leading_number(name.strip_prefix(ITEM_FILE_PREFIX)?)
}

pub fn is_item_extension(ext: &str) -> bool {
    ITEM_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known))
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension().and_then(|ext| ext.to_str()).map(|ext| ext.to_string())
}

fn leading_number(text: &str) -> Option<u32> {
    let end = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    text[..end].parse().ok()
}
