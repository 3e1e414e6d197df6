//! Wire codec for the inserted-customer message payload.
//!
//! The payload is a small XML document:
//!
//! ```text
//! <InsertedCustomer>
//!   <CustomerNumber>..</CustomerNumber>
//!   <CustomerName>..</CustomerName>
//!   <CustomerAddress>..</CustomerAddress>
//!   <EmailAddress>..</EmailAddress>
//! </InsertedCustomer>
//! ```
//!
//! Field values are entity-escaped on encode and unescaped on decode, so a
//! customer name containing `&` round-trips instead of poisoning the
//! message.

use std::fmt;

use crate::change_event::ChangeEvent;

/// Message type tag for inserted-customer request messages.
pub const CUSTOMER_INSERTED_MESSAGE_TYPE: &str =
    "http://ssb.csharp.at/SSB_Book/c10/CustomerInsertedRequestMessage";

const ROOT: &str = "InsertedCustomer";
const TAGS: [&str; 4] = [
    "CustomerNumber",
    "CustomerName",
    "CustomerAddress",
    "EmailAddress",
];

/// Error when decoding a message payload.
///
/// A payload that fails to decode is a poison message candidate: the bytes
/// are immutable, so retrying cannot help.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadError {
    pub message: String,
}

impl PayloadError {
    fn new(message: impl Into<String>) -> Self {
        PayloadError { message: message.into() }
    }
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload error: {}", self.message)
    }
}

impl std::error::Error for PayloadError {}

/// Serialize a change event into the `<InsertedCustomer>` payload text.
pub fn encode(event: &ChangeEvent) -> String {
    let mut xml = String::with_capacity(128);
    xml.push('<');
    xml.push_str(ROOT);
    xml.push('>');
    for (tag, value) in TAGS.iter().zip(values(event)) {
        xml.push('<');
        xml.push_str(tag);
        xml.push('>');
        xml.push_str(&escape(value));
        xml.push_str("</");
        xml.push_str(tag);
        xml.push('>');
    }
    xml.push_str("</");
    xml.push_str(ROOT);
    xml.push('>');
    xml
}

/// Parse an `<InsertedCustomer>` payload back into a change event.
pub fn decode(xml: &str) -> Result<ChangeEvent, PayloadError> {
    let body = element_text(xml, ROOT)?;
    let [number, name, address, email] = TAGS;
    Ok(ChangeEvent {
        customer_number: unescape(element_text(body, number)?)?,
        customer_name: unescape(element_text(body, name)?)?,
        customer_address: unescape(element_text(body, address)?)?,
        email_address: unescape(element_text(body, email)?)?,
    })
}

fn values(event: &ChangeEvent) -> [&str; 4] {
    [
        &event.customer_number,
        &event.customer_name,
        &event.customer_address,
        &event.email_address,
    ]
}

/// Extract the text between `<tag>` and `</tag>`.
fn element_text<'a>(xml: &'a str, tag: &str) -> Result<&'a str, PayloadError> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml
        .find(&open)
        .ok_or_else(|| PayloadError::new(format!("missing <{}> element", tag)))?
        + open.len();
    let end = xml[start..]
        .find(&close)
        .ok_or_else(|| PayloadError::new(format!("unterminated <{}> element", tag)))?;
    Ok(&xml[start..start + end])
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String, PayloadError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let entity = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
        ]
        .iter()
        .find(|(name, _)| rest.starts_with(name));
        match entity {
            Some((name, c)) => {
                out.push(*c);
                rest = &rest[name.len()..];
            }
            None => {
                return Err(PayloadError::new(format!(
                    "unrecognized entity at \"{}\"",
                    &rest[..rest.len().min(8)]
                )))
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}
