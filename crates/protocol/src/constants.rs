/// Namespace of the current upload-slot dialect.
pub const NS_HTTP_UPLOAD: &str = "urn:xmpp:http:upload:0";

/// Namespace of the legacy upload-slot dialect.
pub const NS_HTTP_UPLOAD_LEGACY: &str = "urn:xmpp:http:upload";

/// Namespace of stanza error text elements.
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Header names a slot response may ask the uploader to send.
pub const ALLOWED_SLOT_HEADERS: [&str; 3] = ["Authorization", "Cookie", "Expires"];

/// MIME type reported for PGP-encrypted uploads regardless of the payload.
pub const PGP_MIME_TYPE: &str = "application/pgp-encrypted";
