//! Bootloader config template rendering.
//!
//! Pure text transformation: no pipe is touched here, which keeps rendering
//! testable in isolation from the writer.

use std::collections::HashMap;
use std::path::Path;

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult};

use crate::append::AppendBag;

/// Mapping from product property id to its comma-joined values for one host.
pub type PropertyMap = HashMap<String, String>;

/// Render a bootloader config template.
///
/// Every `%propertyId%` placeholder is replaced with the property value
/// (empty string if the property is unknown). A line whose first token is
/// `append` is re-assembled: its own `key[=value]` tokens form the default
/// bag, `append_params` is merged over it (caller wins), and the effective
/// bag is emitted in insertion order. All other lines pass through with
/// trailing whitespace trimmed. The result always ends in a newline.
pub fn render_template(
    template_file: &Path,
    properties: &PropertyMap,
    append_params: &AppendBag,
) -> OpsipxeconfdResult<String> {
    let raw = std::fs::read_to_string(template_file).map_err(|err| {
        OpsipxeconfdError::Template(format!(
            "failed to read '{}': {}",
            template_file.display(),
            err
        ))
    })?;

    let mut content = String::with_capacity(raw.len());
    for line in raw.lines() {
        let line = substitute_properties(line.trim_end(), properties);

        let stripped = line.trim_start();
        if first_token(stripped) == Some("append") {
            let indent = &line[..line.len() - stripped.len()];
            let mut bag = AppendBag::parse_tokens(&stripped["append".len()..], false);
            bag.merge(append_params);
            content.push_str(indent);
            content.push_str("append");
            if !bag.is_empty() {
                content.push(' ');
                content.push_str(&bag.to_line());
            }
        } else {
            content.push_str(&line);
        }
        content.push('\n');
    }

    Ok(content)
}

fn first_token(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

fn is_property_id(id: &str) -> bool {
    id.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Replace every `%id%` with the property value, empty string if absent.
///
/// A `%` with no closing partner is kept verbatim.
fn substitute_properties(line: &str, properties: &PropertyMap) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 && is_property_id(&after[..end]) => {
                let id = &after[..end];
                if let Some(value) = properties.get(id) {
                    out.push_str(value);
                } // unknown property: empty substitution
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_template(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_append_merge_round_trip() {
        let template = write_template("default opsi\nappend a=1 b=2\n");
        let params = AppendBag::parse_tokens("b=9 c=3", false);
        let rendered = render_template(template.path(), &PropertyMap::new(), &params).unwrap();
        assert_eq!(rendered, "default opsi\nappend a=1 b=9 c=3\n");
    }

    #[test]
    fn test_duplicate_template_key_last_wins() {
        let template = write_template("append a=1 a=2 b=3\n");
        let params = AppendBag::parse_tokens("c=4", false);
        let rendered = render_template(template.path(), &PropertyMap::new(), &params).unwrap();
        assert_eq!(rendered, "append a=2 b=3 c=4\n");
    }

    #[test]
    fn test_property_substitution() {
        let template = write_template("kernel %bootimage%\nappend lang=%lang%\n");
        let mut properties = PropertyMap::new();
        properties.insert("bootimage".into(), "vmlinuz-5.10".into());
        properties.insert("lang".into(), "de".into());
        let rendered =
            render_template(template.path(), &properties, &AppendBag::new()).unwrap();
        assert_eq!(rendered, "kernel vmlinuz-5.10\nappend lang=de\n");
    }

    #[test]
    fn test_unknown_property_becomes_empty() {
        let template = write_template("say %missing%!\n");
        let rendered =
            render_template(template.path(), &PropertyMap::new(), &AppendBag::new()).unwrap();
        assert_eq!(rendered, "say !\n");
    }

    #[test]
    fn test_lone_percent_is_kept() {
        let template = write_template("progress 100%\n");
        let rendered =
            render_template(template.path(), &PropertyMap::new(), &AppendBag::new()).unwrap();
        assert_eq!(rendered, "progress 100%\n");
    }

    #[test]
    fn test_indented_append_keeps_indent() {
        let template = write_template("label opsi\n  append initrd=opsi\n");
        let params = AppendBag::parse_tokens("hn=h1", false);
        let rendered = render_template(template.path(), &PropertyMap::new(), &params).unwrap();
        assert_eq!(rendered, "label opsi\n  append initrd=opsi hn=h1\n");
    }

    #[test]
    fn test_missing_template_is_an_error() {
        let err = render_template(
            Path::new("/nonexistent/install"),
            &PropertyMap::new(),
            &AppendBag::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("template error"));
    }

    #[test]
    fn test_trailing_whitespace_trimmed() {
        let template = write_template("kernel opsi   \n");
        let rendered =
            render_template(template.path(), &PropertyMap::new(), &AppendBag::new()).unwrap();
        assert_eq!(rendered, "kernel opsi\n");
    }
}
