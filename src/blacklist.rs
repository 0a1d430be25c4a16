//! Publisher blacklist.
//!
//! The blacklist document holds `[entry]` children whose attributes are
//! glob patterns (`*` any run, `?` one character) over upload metadata.
//! An entry matches when it specifies at least one pattern and every
//! specified pattern matches its field; entries combine as alternatives.
//! Matching folds case.

use crate::document::Document;

#[derive(Debug, Clone, Default)]
struct Entry {
    name: Option<String>,
    title: Option<String>,
    description: Option<String>,
    author: Option<String>,
    ip: Option<String>,
    email: Option<String>,
}

impl Entry {
    fn read(doc: &Document) -> Entry {
        let field = |key: &str| doc.attr(key).filter(|v| !v.is_empty()).map(str::to_string);
        Entry {
            name: field("name"),
            title: field("title"),
            description: field("description"),
            author: field("author"),
            ip: field("ip"),
            email: field("email"),
        }
    }

    fn matches(&self, upload: &UploadIdentity<'_>) -> bool {
        let checks = [
            (&self.name, upload.name),
            (&self.title, upload.title),
            (&self.description, upload.description),
            (&self.author, upload.author),
            (&self.ip, upload.addr),
            (&self.email, upload.email),
        ];
        let mut specified = false;
        for (pattern, value) in checks {
            if let Some(pattern) = pattern {
                specified = true;
                if !wildcard_match(pattern, value) {
                    return false;
                }
            }
        }
        specified
    }
}

/// The upload metadata fields subject to blacklisting.
#[derive(Debug, Clone, Copy)]
pub struct UploadIdentity<'a> {
    pub name: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub author: &'a str,
    pub addr: &'a str,
    pub email: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    entries: Vec<Entry>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(doc: &Document) -> Blacklist {
        Blacklist {
            entries: doc.children("entry").map(Entry::read).collect(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_blacklisted(&self, upload: &UploadIdentity<'_>) -> bool {
        self.entries.iter().any(|entry| entry.matches(upload))
    }
}

/// Iterative glob match with single-star backtracking. Also used for the
/// stats-exempt address masks.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
