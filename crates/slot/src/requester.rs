//! Slot request construction and response parsing.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_protocol::{Element, Iq, IqType, Slot};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::channel::{Dialect, SignalingChannel, UploadService};
use crate::error::SlotError;

/// Shortens `<uuid>.<ext>` file names to `<base64url(uuid)>.<ext>`.
///
/// Only the hyphenated 36-character form is recognised; any other name is
/// returned unchanged.
pub fn convert_filename(name: &str) -> String {
    let Some(pos) = name.find('.') else {
        return name.to_string();
    };
    let (stem, rest) = name.split_at(pos);
    if stem.len() != 36 {
        return name.to_string();
    }
    match Uuid::try_parse(stem) {
        Ok(uuid) => format!("{}{rest}", URL_SAFE_NO_PAD.encode(uuid.as_bytes())),
        Err(_) => name.to_string(),
    }
}

/// Builds the `<request/>` payload for the given dialect.
pub fn build_request(dialect: Dialect, file_name: &str, size: u64, mime: Option<&str>) -> Element {
    let ns = dialect.namespace();
    match dialect {
        Dialect::Current => {
            let mut request = Element::with_ns("request", ns)
                .attr("filename", file_name)
                .attr("size", size.to_string());
            if let Some(mime) = mime {
                request.set_attribute("content-type", mime);
            }
            request
        }
        Dialect::Legacy => {
            let mut request = Element::with_ns("request", ns)
                .child(Element::new("filename").text(file_name))
                .child(Element::new("size").text(size.to_string()));
            if let Some(mime) = mime {
                request.children.push(Element::new("content-type").text(mime));
            }
            request
        }
    }
}

fn protocol_error(host: &str, reason: &str) -> SlotError {
    SlotError::Protocol {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_url(raw: Option<&str>, host: &str, what: &str) -> Result<Url, SlotError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| protocol_error(host, &format!("missing {what} URL")))?;
    Ok(Url::parse(raw)?)
}

/// Extracts a [`Slot`] from a `result` IQ.
///
/// Headers outside the allow-list, or with multi-line values, are dropped.
pub fn parse_slot(dialect: Dialect, host: &str, response: &Iq) -> Result<Slot, SlotError> {
    let slot = response
        .payload
        .as_ref()
        .filter(|p| p.name == "slot")
        .ok_or_else(|| protocol_error(host, "no slot in response"))?;
    if slot.namespace.as_deref() != Some(dialect.namespace()) {
        return Err(protocol_error(host, "slot in unexpected namespace"));
    }

    let put = slot
        .find_child("put")
        .ok_or_else(|| protocol_error(host, "no put element"))?;
    let get = slot
        .find_child("get")
        .ok_or_else(|| protocol_error(host, "no get element"))?;

    match dialect {
        Dialect::Legacy => Ok(Slot::new(
            parse_url(Some(put.text.as_str()), host, "put")?,
            parse_url(Some(get.text.as_str()), host, "get")?,
        )),
        Dialect::Current => {
            let mut parsed = Slot::new(
                parse_url(put.attribute("url"), host, "put")?,
                parse_url(get.attribute("url"), host, "get")?,
            );
            for header in put.children_named("header") {
                let Some(name) = header.attribute("name") else {
                    continue;
                };
                if let Err(e) = parsed.add_header(name, &header.text) {
                    warn!(host, error = %e, "dropping slot header");
                }
            }
            Ok(parsed)
        }
    }
}

/// Requests upload slots from the service advertised by a signaling channel.
pub struct SlotRequester {
    channel: Arc<dyn SignalingChannel>,
}

impl SlotRequester {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    /// Requests a slot for a file of `size` bytes on the wire.
    pub async fn request(
        &self,
        file_name: &str,
        size: u64,
        mime: Option<&str>,
    ) -> Result<Slot, SlotError> {
        let UploadService { host, dialect } =
            self.channel.upload_service().ok_or(SlotError::NoService)?;

        let file_name = convert_filename(file_name);
        let payload = build_request(dialect, &file_name, size, mime);
        let iq = Iq::get(Uuid::new_v4().simple().to_string(), host.clone(), payload);
        debug!(host = %host, ?dialect, file = %file_name, size, "requesting upload slot");

        let response = self.channel.send_iq(iq).await?;
        match response.kind {
            IqType::Result => {
                let slot = parse_slot(dialect, &host, &response)?;
                info!(host = %host, put = %slot.put, "upload slot granted");
                Ok(slot)
            }
            IqType::Error => Err(SlotError::Rejected {
                message: response.error_message(),
                host,
            }),
            other => Err(protocol_error(
                &host,
                &format!("unexpected IQ type {}", other.as_str()),
            )),
        }
    }
}
