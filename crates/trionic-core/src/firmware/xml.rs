//! Symbol name tables shipped as XML, one file per software version
//!
//! Only the subset these files use is understood: a root element whose
//! children each carry `SYMBOLNUMBER` and `DESCRIPTION` text elements.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::FirmwareError;

/// Software versions with a known XML name table, and the file they map to
const VERSIONS: [(&str, &str); 4] = [
    ("EU0CF01O", "EU0CF01O"),
    ("EU0AF01C", "EU0AF01C"),
    ("EU0BF01C", "EU0AF01C"),
    ("EU0CF01C", "EU0AF01C"),
];

/// Name of the XML table matching a version string embedded in the image
pub(crate) fn determine_version(image: &[u8]) -> Option<&'static str> {
    VERSIONS
        .iter()
        .find(|(needle, _)| super::search::find(image, needle.as_bytes(), 0).is_some())
        .map(|(_, table)| *table)
}

/// Load `<dir>/<version>.xml` as a number → name map
pub(crate) fn load_table(dir: &Path, version: &str) -> Result<HashMap<i32, String>, FirmwareError> {
    let path = dir.join(format!("{}.xml", version));
    let text = std::fs::read_to_string(&path)
        .map_err(|_| FirmwareError::VersionUnknown(version.to_string()))?;
    let table = parse_table(&text);
    debug!(path = %path.display(), entries = table.len(), "Loaded XML symbol table");
    Ok(table)
}

pub(crate) fn parse_table(text: &str) -> HashMap<i32, String> {
    let mut table = HashMap::new();
    let mut depth = 0usize;
    let mut field: Option<String> = None;
    let mut number: Option<i32> = None;
    let mut name: Option<String> = None;
    let mut rest = text;

    while let Some(open) = rest.find('<') {
        let content = &rest[..open];
        if let Some(tag) = field.as_deref() {
            let value = unescape(content.trim());
            match tag {
                "SYMBOLNUMBER" => number = value.parse().ok(),
                "DESCRIPTION" => name = Some(value),
                _ => {}
            }
        }

        let after = &rest[open + 1..];
        let skip_to = if after.starts_with("!--") {
            after.find("-->").map(|p| p + 3)
        } else {
            after.find('>').map(|p| p + 1)
        };
        let Some(close) = skip_to else { break };
        let tag = &after[..close - 1];
        rest = &after[close..];

        if tag.starts_with('?') || tag.starts_with('!') || tag.ends_with('/') {
            continue;
        }
        if let Some(end) = tag.strip_prefix('/') {
            depth = depth.saturating_sub(1);
            field = None;
            if depth == 1 && end.trim() != "DESCRIPTION" && end.trim() != "SYMBOLNUMBER" {
                if let (Some(n), Some(d)) = (number.take(), name.take()) {
                    table.insert(n, d);
                }
            }
            continue;
        }

        depth += 1;
        let element = tag.split_whitespace().next().unwrap_or_default();
        if depth == 3 {
            field = Some(element.to_string());
        } else if depth == 2 {
            number = None;
            name = None;
        }
    }
    table
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"<?xml version="1.0" standalone="yes"?>
<DocumentElement>
  <SYMBOL>
    <SYMBOLNAME>Symbol-1</SYMBOLNAME>
    <SYMBOLNUMBER>1</SYMBOLNUMBER>
    <FLASHADDRESS>0x0F0000</FLASHADDRESS>
    <DESCRIPTION>In.v_Vehicle</DESCRIPTION>
  </SYMBOL>
  <!-- comment -->
  <SYMBOL>
    <DESCRIPTION>Lambda &amp; friends</DESCRIPTION>
    <SYMBOLNUMBER>7</SYMBOLNUMBER>
    <EMPTY/>
  </SYMBOL>
</DocumentElement>"#;

    #[test]
    fn test_parse_table() {
        let table = parse_table(TABLE);
        assert_eq!(table.len(), 2);
        assert_eq!(table[&1], "In.v_Vehicle");
        assert_eq!(table[&7], "Lambda & friends");
    }

    #[test]
    fn test_determine_version() {
        let mut image = vec![0u8; 64];
        image[10..18].copy_from_slice(b"EU0BF01C");
        assert_eq!(determine_version(&image), Some("EU0AF01C"));
        image[10..18].copy_from_slice(b"EU0CF01O");
        assert_eq!(determine_version(&image), Some("EU0CF01O"));
        assert_eq!(determine_version(&[0u8; 8]), None);
    }

    #[test]
    fn test_missing_file_is_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_table(dir.path(), "EU0AF01C").unwrap_err();
        assert_eq!(err, FirmwareError::VersionUnknown("EU0AF01C".into()));
    }
}
