//! Ordered, case-preserving HTTP header map.
//!
//! Header names are matched case-insensitively but the spelling of the
//! first occurrence is kept for output, so a parsed message serializes back
//! byte-identically. Repeated names stay as separate entries in arrival
//! order (multi-value headers).

/// An ordered multimap of HTTP headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns the value of the first header with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values for the given name, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Checks whether a header with the given name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a header entry, keeping existing entries with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Sets a header, overwriting any prior value for that name.
    ///
    /// The first existing entry keeps its position and spelling and receives
    /// the new value; later duplicates are dropped. If no entry exists the
    /// header is appended with the given spelling.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let mut first = None;
        for (i, (n, _)) in self.entries.iter().enumerate() {
            if n.eq_ignore_ascii_case(name) {
                first = Some(i);
                break;
            }
        }
        match first {
            Some(i) => {
                self.entries[i].1 = value.into();
                let keep = i;
                let mut idx = 0;
                self.entries.retain(|(n, _)| {
                    let dup = idx != keep && n.eq_ignore_ascii_case(name);
                    idx += 1;
                    !dup
                });
            }
            None => self.entries.push((name.to_string(), value.into())),
        }
    }

    /// Removes all entries with the given name. Returns true if any existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    /// Iterates over `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header entries (duplicates counted separately).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (n, v) in iter {
            map.append(n, v);
        }
        map
    }
}
