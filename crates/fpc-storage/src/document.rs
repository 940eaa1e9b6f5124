//! Cache file format: a raw header block followed by the body.
//!
//! ```text
//! Content-Type: text/html\r\n
//! x-cache-ctime: 1000\r\n
//! \r\n
//! <html>...
//! ```
//!
//! The header block carries expiry metadata and always travels with the body.

const SEPARATOR: &[u8] = b"\r\n\r\n";

/// Ordered header list with case-insensitive lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    entries: Vec<(String, String)>,
}

impl HeaderBlock {
    /// Create an empty block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`append`](Self::append).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.append(name, value);
        self
    }

    /// Add a header, keeping existing values with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_owned(), value.into()));
    }

    /// Drop every value of `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First value of `name` parsed as an integer.
    #[must_use]
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name)?.trim().parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse `Name: Value` lines. Names are lowercased, values trimmed, lines
    /// without a colon are skipped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .split("\r\n")
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_ascii_lowercase(), value.trim().to_owned()))
            })
            .collect();
        Self { entries }
    }

    fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(n, v)| format!("{n}: {v}"))
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderBlock {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// One cache file: headers plus body bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheDocument {
    pub headers: HeaderBlock,
    pub body: Vec<u8>,
}

impl CacheDocument {
    #[must_use]
    pub fn new(headers: HeaderBlock, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Split raw file bytes at the first blank line.
    ///
    /// Without a separator the whole file is the body and there are no
    /// headers.
    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Self {
        match raw.windows(SEPARATOR.len()).position(|w| w == SEPARATOR) {
            Some(split) => Self {
                headers: HeaderBlock::parse(&String::from_utf8_lossy(&raw[..split])),
                body: raw[split + SEPARATOR.len()..].to_vec(),
            },
            None => Self {
                headers: HeaderBlock::new(),
                body: raw.to_vec(),
            },
        }
    }

    /// Serialize as `headers\r\n\r\nbody`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let headers = self.headers.render();
        let mut out = Vec::with_capacity(headers.len() + SEPARATOR.len() + self.body.len());
        out.extend_from_slice(headers.as_bytes());
        out.extend_from_slice(SEPARATOR);
        out.extend_from_slice(&self.body);
        out
    }
}
