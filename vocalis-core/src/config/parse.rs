use std::collections::HashMap;

/// A single `[section]` block: ordered insertion doesn't matter, lookups do.
#[derive(Debug, Default, Clone)]
pub struct Section(HashMap<String, String>);

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Parse `[section]` / `key = value` text into a map of sections.
///
/// Blank lines and lines starting with `#` or `;` are ignored. Keys before
/// the first `[section]` header are silently dropped — every recognized key
/// in this file belongs to a section.
pub fn parse_sections(text: &str) -> HashMap<String, Section> {
    let mut sections: HashMap<String, Section> = HashMap::new();
    let mut current: Option<String> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let Some(name) = current.as_ref() else {
            continue;
        };

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let value = value.trim().trim_matches('"').to_string();
            sections.entry(name.clone()).or_default().0.insert(key, value);
        }
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_comments_and_blank_lines() {
        let text = "\n# comment\n[general]\n; also a comment\nlocale = en-US\n\n";
        let sections = parse_sections(text);
        assert_eq!(sections.get("general").unwrap().get("locale"), Some("en-US"));
    }

    #[test]
    fn strips_surrounding_quotes_from_values() {
        let text = "[general]\nurl = \"wss://example/ws\"\n";
        let sections = parse_sections(text);
        assert_eq!(
            sections.get("general").unwrap().get("url"),
            Some("wss://example/ws")
        );
    }

    #[test]
    fn keys_before_any_section_are_dropped() {
        let text = "orphan = 1\n[general]\nlocale = en-US\n";
        let sections = parse_sections(text);
        assert!(sections.get("general").unwrap().get("orphan").is_none());
    }
}
