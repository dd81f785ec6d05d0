use std::collections::BTreeMap;

use url::Url;

use crate::constants::ALLOWED_SLOT_HEADERS;

/// Reasons a slot header is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotHeaderError {
    #[error("header not allowed: {0}")]
    NotAllowed(String),

    #[error("header {0} has a multi-line value")]
    MultiLine(String),
}

/// Upload authorization returned by the upload service.
///
/// `put` receives the body, `get` is what peers download from. `headers`
/// only ever holds allow-listed names with single-line values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub put: Url,
    pub get: Url,
    headers: BTreeMap<String, String>,
}

impl Slot {
    pub fn new(put: Url, get: Url) -> Self {
        Self {
            put,
            get,
            headers: BTreeMap::new(),
        }
    }

    /// Adds a header requested by the upload service.
    ///
    /// The name must be one of `Authorization`, `Cookie`, `Expires` (exact
    /// case). The value is trimmed and must not contain a line break.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), SlotHeaderError> {
        if !ALLOWED_SLOT_HEADERS.contains(&name) {
            return Err(SlotHeaderError::NotAllowed(name.to_string()));
        }
        let value = value.trim();
        if value.contains('\n') || value.contains('\r') {
            return Err(SlotHeaderError::MultiLine(name.to_string()));
        }
        self.headers.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        Slot::new(
            Url::parse("https://up.example.org/put/abc").unwrap(),
            Url::parse("https://up.example.org/get/abc").unwrap(),
        )
    }

    #[test]
    fn accepts_allow_listed_headers_trimmed() {
        let mut s = slot();
        s.add_header("Authorization", "  Basic Zm9v ").unwrap();
        s.add_header("Cookie", "a=b").unwrap();
        s.add_header("Expires", "Tue, 1 Jan 2030").unwrap();
        assert_eq!(s.headers().len(), 3);
        assert_eq!(s.headers()["Authorization"], "Basic Zm9v");
    }

    #[test]
    fn rejects_unknown_header_names() {
        let mut s = slot();
        let err = s.add_header("X-Evil", "1").unwrap_err();
        assert_eq!(err, SlotHeaderError::NotAllowed("X-Evil".into()));
        // Names are matched exactly.
        assert!(s.add_header("authorization", "x").is_err());
        assert!(s.headers().is_empty());
    }

    #[test]
    fn rejects_multiline_values() {
        let mut s = slot();
        assert_eq!(
            s.add_header("Cookie", "a=b\nX-Injected: 1").unwrap_err(),
            SlotHeaderError::MultiLine("Cookie".into())
        );
        assert!(s.add_header("Cookie", "a=b\r\nc").is_err());
        // A trailing newline is trimmed away and therefore fine.
        s.add_header("Cookie", "a=b\n").unwrap();
        assert_eq!(s.headers()["Cookie"], "a=b");
    }
}
