//! The `aesgcm://` convention: an https URL whose fragment carries the hex
//! of `IV || key` for the file behind it.

use ::url::Url;

/// Scheme marking an encrypted-transport URL.
pub const AESGCM_SCHEME: &str = "aesgcm";

/// Errors raised while translating URLs.
#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("missing scheme separator in {0:?}")]
    MissingScheme(String),

    #[error("invalid URL: {0}")]
    Parse(#[from] ::url::ParseError),
}

/// Rewrites an `https` URL into the `aesgcm` scheme. Anything else is
/// returned unchanged.
pub fn to_encrypted_scheme(url: &Url) -> String {
    let raw = url.as_str();
    if url.scheme() == "https" {
        format!("{AESGCM_SCHEME}{}", &raw["https".len()..])
    } else {
        raw.to_string()
    }
}

/// Parses a URL, mapping the `aesgcm` scheme (any case) back to `https`.
pub fn from_encrypted_scheme(raw: &str) -> Result<Url, UrlError> {
    let raw = raw.trim();
    let sep = raw
        .find("://")
        .ok_or_else(|| UrlError::MissingScheme(raw.to_string()))?;
    if raw[..sep].eq_ignore_ascii_case(AESGCM_SCHEME) {
        Ok(Url::parse(&format!("https{}", &raw[sep..]))?)
    } else {
        Ok(Url::parse(raw)?)
    }
}

/// Decodes a fragment of exactly 96 or 88 hex characters into key material.
pub fn key_from_fragment(fragment: &str) -> Option<Vec<u8>> {
    if fragment.len() != 96 && fragment.len() != 88 {
        return None;
    }
    hex::decode(fragment).ok()
}

/// Returns `url` without its fragment, as sent over the wire.
pub fn strip_fragment(url: &Url) -> Url {
    let mut stripped = url.clone();
    stripped.set_fragment(None);
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_becomes_aesgcm() {
        let url = Url::parse("https://files.example.org/a/b.jpg?x=1#abcd").unwrap();
        assert_eq!(
            to_encrypted_scheme(&url),
            "aesgcm://files.example.org/a/b.jpg?x=1#abcd"
        );
    }

    #[test]
    fn other_schemes_pass_through() {
        let url = Url::parse("http://files.example.org/a.jpg").unwrap();
        assert_eq!(to_encrypted_scheme(&url), "http://files.example.org/a.jpg");
    }

    #[test]
    fn aesgcm_parses_as_https_in_any_case() {
        let url = from_encrypted_scheme("AesGcm://h.example/p/f.png#00ff").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("h.example"));
        assert_eq!(url.path(), "/p/f.png");
        assert_eq!(url.fragment(), Some("00ff"));
    }

    #[test]
    fn round_trip_preserves_url() {
        let url = Url::parse("https://h.example:8443/p/f.png?q=1#frag").unwrap();
        assert_eq!(from_encrypted_scheme(&to_encrypted_scheme(&url)).unwrap(), url);
    }

    #[test]
    fn rejects_text_without_scheme() {
        assert!(matches!(
            from_encrypted_scheme("just some text"),
            Err(UrlError::MissingScheme(_))
        ));
        assert!(matches!(
            from_encrypted_scheme("https://"),
            Err(UrlError::Parse(_))
        ));
    }

    #[test]
    fn fragment_key_lengths() {
        assert_eq!(key_from_fragment(&"ab".repeat(48)).unwrap().len(), 48);
        assert_eq!(key_from_fragment(&"0f".repeat(44)).unwrap().len(), 44);
        assert!(key_from_fragment(&"ab".repeat(32)).is_none());
        assert!(key_from_fragment(&"zz".repeat(48)).is_none());
        assert!(key_from_fragment("").is_none());
    }

    #[test]
    fn strip_fragment_keeps_query() {
        let url = Url::parse("https://h/p?q=1#secret").unwrap();
        assert_eq!(strip_fragment(&url).as_str(), "https://h/p?q=1");
    }
}
