//! Keyed reply pools loaded from plain text files.
//!
//! A file is a sequence of sections. A section header is a line of the form
//! `[key1|key2]`; every non-empty line until the next header is appended to
//! the pool of each key in the header. Keys are matched against message
//! content as case-insensitive substrings, in the order they first appear in
//! the file. The same file format backs both the scripted template pools and
//! the keyword reply pools; the two differ only in how a reply is drawn from
//! the pool (round-robin vs random without replacement), which is owned by
//! the coordination state.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

static SECTION_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(.+)\]$").expect("section header pattern"));

/// Reply pools keyed by lower-cased trigger text, in first-appearance order.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    sections: Vec<(String, Vec<String>)>,
}

impl TemplateStore {
    pub fn parse(text: &str) -> Self {
        let mut sections: Vec<(String, Vec<String>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        // Indices into `sections` for the keys of the current header.
        let mut current: Vec<usize> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(captures) = SECTION_HEADER.captures(line) {
                current.clear();
                for key in captures[1].to_lowercase().split('|') {
                    let key = key.trim();
                    if key.is_empty() {
                        continue;
                    }
                    let slot = *index.entry(key.to_string()).or_insert_with(|| {
                        sections.push((key.to_string(), Vec::new()));
                        sections.len() - 1
                    });
                    if !current.contains(&slot) {
                        current.push(slot);
                    }
                }
            } else if !current.is_empty() {
                for &slot in &current {
                    sections[slot].1.push(line.to_string());
                }
            }
        }

        TemplateStore { sections }
    }

    pub fn load(path: &str) -> Result<Self, String> {
        let text = std::fs::read_to_string(Path::new(path))
            .map_err(|e| format!("failed to read template file {}: {}", path, e))?;
        let store = Self::parse(&text);
        if store.is_empty() {
            return Err(format!("template file {} has no sections", path));
        }
        Ok(store)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn pool(&self, key: &str) -> Option<&[String]> {
        self.sections
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, pool)| pool.as_slice())
    }

    /// First key (enumeration order) contained in the lower-cased content.
    pub fn first_match(&self, content: &str) -> Option<&str> {
        let content = content.to_lowercase();
        self.sections
            .iter()
            .find(|(key, _)| content.contains(key.as_str()))
            .map(|(key, _)| key.as_str())
    }

    /// Like `first_match`, skipping keys already claimed in this round.
    pub fn first_match_excluding(&self, content: &str, used: &HashSet<String>) -> Option<&str> {
        let content = content.to_lowercase();
        self.sections
            .iter()
            .find(|(key, _)| content.contains(key.as_str()) && !used.contains(key.as_str()))
            .map(|(key, _)| key.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[gm|good morning]
gm fam
morning all

[wen]
soon
patience

[gm]
rise and shine
";

    #[test]
    fn parse_sections_with_shared_keys() {
        let store = TemplateStore::parse(SAMPLE);
        assert_eq!(store.len(), 3);
        // Lines under a multi-key header land in both pools
        assert_eq!(
            store.pool("gm").unwrap(),
            &["gm fam", "morning all", "rise and shine"]
        );
        assert_eq!(store.pool("good morning").unwrap(), &["gm fam", "morning all"]);
        assert_eq!(store.pool("wen").unwrap(), &["soon", "patience"]);
        assert!(store.pool("unknown").is_none());
    }

    #[test]
    fn first_match_uses_enumeration_order() {
        let store = TemplateStore::parse(SAMPLE);
        // Both "gm" and "wen" appear; "gm" was declared first
        assert_eq!(store.first_match("GM everyone, wen moon?"), Some("gm"));
        assert_eq!(store.first_match("wen listing"), Some("wen"));
        assert_eq!(store.first_match("nothing matches"), None);
    }

    #[test]
    fn first_match_excluding_skips_claimed_keys() {
        let store = TemplateStore::parse(SAMPLE);
        let mut used = HashSet::new();
        used.insert("gm".to_string());
        assert_eq!(
            store.first_match_excluding("gm, wen moon?", &used),
            Some("wen")
        );
        used.insert("wen".to_string());
        assert_eq!(store.first_match_excluding("gm, wen moon?", &used), None);
    }

    #[test]
    fn load_rejects_missing_or_headerless_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.txt");
        std::fs::write(&path, "no headers here\n").unwrap();
        assert!(TemplateStore::load(path.to_str().unwrap()).is_err());
        assert!(TemplateStore::load("/nonexistent/templates.txt").is_err());

        std::fs::write(&path, "[hey]\nyo\n").unwrap();
        let store = TemplateStore::load(path.to_str().unwrap()).unwrap();
        assert_eq!(store.pool("hey").unwrap(), &["yo"]);
    }
}
