//! MIME encoding for outgoing messages.
//!
//! Every message is `multipart/mixed`: the body part first, then one part per
//! attachment in attach order. Image attachments become inline parts, all
//! other content becomes a downloadable attachment part.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use mime::Mime;
use uuid::Uuid;

use crate::errors::{MailError, MailErrorKind, MailResult};
use crate::types::{Address, Attachment, AttachmentKind, Message};

/// Extensions that denote a compression or transfer encoding rather than a
/// content type. Files carrying them are sent as opaque bytes.
const ENCODING_EXTENSIONS: &[&str] = &[
    "gz", "z", "bz2", "xz", "br", "tgz", "taz", "tz", "tbz2", "txz", "svgz",
];

/// Maximum encoded-word payload, in bytes of UTF-8 input.
const ENCODED_WORD_CHUNK: usize = 45;

/// Resolves the content type of `path` from its extension.
///
/// Unknown extensions and compression extensions resolve to
/// `application/octet-stream`.
pub fn resolve_content_type(path: &Path) -> Mime {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension {
        Some(ext) if ENCODING_EXTENSIONS.contains(&ext.as_str()) => mime::APPLICATION_OCTET_STREAM,
        _ => mime_guess::from_path(path)
            .first()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM),
    }
}

/// Chooses the part kind for a content type.
pub fn classify(content_type: &Mime) -> AttachmentKind {
    if content_type.type_() == mime::IMAGE {
        AttachmentKind::InlineImage
    } else {
        AttachmentKind::Binary
    }
}

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// Quoted-printable, used for body text.
    QuotedPrintable,
    /// Base64, used for attachments.
    Base64,
}

impl TransferEncoding {
    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
        }
    }
}

/// MIME encoder for messages.
#[derive(Debug, Clone)]
pub struct MimeEncoder {
    date: DateTime<Utc>,
    domain: String,
}

impl MimeEncoder {
    /// Creates an encoder stamping messages with the current time.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            date: Utc::now(),
            domain: domain.into(),
        }
    }

    /// Encodes `message` to RFC 5322 format.
    pub fn encode(&self, message: &Message, message_id: &str) -> MailResult<Vec<u8>> {
        let mut output = Vec::with_capacity(estimated_size(message));

        self.write_header(&mut output, "Date", &self.format_date())?;
        self.write_header(&mut output, "From", &format_address(&message.from))?;
        let to_list: Vec<String> = message.to.iter().map(format_address).collect();
        self.write_header(&mut output, "To", &to_list.join(", "))?;
        self.write_header(&mut output, "Subject", &encode_header(&message.subject))?;
        self.write_header(&mut output, "Message-ID", &format!("<{}>", message_id))?;
        self.write_header(&mut output, "MIME-Version", "1.0")?;

        let boundary = generate_boundary();
        self.write_header(
            &mut output,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        )?;
        output.extend_from_slice(b"\r\n");

        output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        self.write_body_part(&mut output, message)?;

        for attachment in message.attachments() {
            output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            match attachment.kind() {
                AttachmentKind::InlineImage => self.write_inline_image(&mut output, attachment)?,
                AttachmentKind::Binary => self.write_attachment(&mut output, attachment)?,
            }
        }

        output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        Ok(output)
    }

    /// Generates a unique message ID under the encoder's domain.
    pub fn generate_message_id(&self) -> String {
        format!("{}.{}@{}", Uuid::new_v4().simple(), self.date.timestamp(), self.domain)
    }

    fn write_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> MailResult<()> {
        if value.contains(['\r', '\n']) {
            return Err(MailError::invalid_argument(
                MailErrorKind::InvalidHeader,
                format!("Header {} cannot contain line breaks", name),
            ));
        }

        let header = format!("{}: {}", name, value);
        output.extend_from_slice(fold_header(&header).as_bytes());
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    fn format_date(&self) -> String {
        self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
    }

    fn write_body_part(&self, output: &mut Vec<u8>, message: &Message) -> MailResult<()> {
        self.write_header(
            output,
            "Content-Type",
            &format!("text/{}; charset=utf-8", message.subtype),
        )?;
        self.write_header(
            output,
            "Content-Transfer-Encoding",
            TransferEncoding::QuotedPrintable.header_value(),
        )?;
        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(&quoted_printable::encode(message.body.as_bytes()));
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    fn write_inline_image(&self, output: &mut Vec<u8>, attachment: &Attachment) -> MailResult<()> {
        let name = filename_param("name", attachment.filename());
        self.write_header(
            output,
            "Content-Type",
            &format!("{}; {}", attachment.content_type().essence_str(), name),
        )?;
        self.write_header(output, "Content-Transfer-Encoding", TransferEncoding::Base64.header_value())?;
        self.write_header(output, "Content-ID", &format!("<{}>", content_id(attachment.filename())))?;
        self.write_header(
            output,
            "Content-Disposition",
            &format!("inline; {}", filename_param("filename", attachment.filename())),
        )?;
        output.extend_from_slice(b"\r\n");
        write_base64(output, attachment.data());
        Ok(())
    }

    fn write_attachment(&self, output: &mut Vec<u8>, attachment: &Attachment) -> MailResult<()> {
        let name = filename_param("name", attachment.filename());
        self.write_header(
            output,
            "Content-Type",
            &format!("{}; {}", attachment.content_type().essence_str(), name),
        )?;
        self.write_header(output, "Content-Transfer-Encoding", TransferEncoding::Base64.header_value())?;
        self.write_header(
            output,
            "Content-Disposition",
            &format!("attachment; {}", filename_param("filename", attachment.filename())),
        )?;
        output.extend_from_slice(b"\r\n");
        write_base64(output, attachment.data());
        Ok(())
    }

    /// Applies SMTP dot-stuffing and appends the `<CRLF>.<CRLF>` terminator.
    pub fn prepare_data_content(encoded: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(encoded.len() + 64);
        let mut at_line_start = true;

        for &byte in encoded {
            if at_line_start && byte == b'.' {
                output.push(b'.');
            }
            output.push(byte);
            at_line_start = byte == b'\n';
        }

        if !output.ends_with(b"\r\n") {
            if output.ends_with(b"\n") {
                output.pop();
            }
            output.extend_from_slice(b"\r\n");
        }
        output.extend_from_slice(b".\r\n");
        output
    }
}

impl Default for MimeEncoder {
    fn default() -> Self {
        Self::new("localhost")
    }
}

fn estimated_size(message: &Message) -> usize {
    let attachments: usize = message
        .attachments()
        .iter()
        .map(|a| a.data().len() * 4 / 3 + 256)
        .sum();
    1024 + message.body.len() * 3 + attachments
}

fn generate_boundary() -> String {
    format!("----=_Part_{}", Uuid::new_v4().simple())
}

fn content_id(filename: &str) -> String {
    filename
        .chars()
        .map(|c| if c.is_ascii_graphic() && !"<>\"\\".contains(c) { c } else { '_' })
        .collect()
}

fn format_address(address: &Address) -> String {
    match address.name() {
        Some(name) if !name.is_ascii() => format!("{} <{}>", encode_header(name), address.email()),
        _ => address.to_header(),
    }
}

/// Encodes a header value using RFC 2047 when it is not plain ASCII.
fn encode_header(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_CHUNK {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
    }
    words.join(" ")
}

/// Formats a filename parameter, using RFC 2231 for non-ASCII names.
fn filename_param(param: &str, filename: &str) -> String {
    if filename.is_ascii() {
        let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
        return format!("{}=\"{}\"", param, escaped);
    }

    let mut encoded = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!("{}*=UTF-8''{}", param, encoded)
}

/// Folds a header line at 78 characters on whitespace.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::with_capacity(header.len() + 16);
    let mut current_line = String::new();

    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line.push_str(word);
        } else if current_line.len() + 1 + word.len() <= 76 {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }

    result.push_str(&current_line);
    result
}

fn write_base64(output: &mut Vec<u8>, data: &[u8]) {
    let encoded = BASE64.encode(data);
    for chunk in encoded.as_bytes().chunks(76) {
        output.extend_from_slice(chunk);
        output.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BodySubtype;
    use rstest::rstest;
    use std::path::PathBuf;

    #[rstest]
    #[case("photo.png", "image/png")]
    #[case("photo.JPG", "image/jpeg")]
    #[case("report.pdf", "application/pdf")]
    #[case("sheet.xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")]
    #[case("notes.txt", "text/plain")]
    #[case("archive.tar.gz", "application/octet-stream")]
    #[case("dump.sql.bz2", "application/octet-stream")]
    #[case("old.Z", "application/octet-stream")]
    #[case("unknown.zzqx", "application/octet-stream")]
    #[case("no_extension", "application/octet-stream")]
    fn test_resolve_content_type(#[case] filename: &str, #[case] expected: &str) {
        let resolved = resolve_content_type(&PathBuf::from("/tmp").join(filename));
        assert_eq!(resolved.essence_str(), expected);
    }

    #[rstest]
    #[case("image/png", AttachmentKind::InlineImage)]
    #[case("image/svg+xml", AttachmentKind::InlineImage)]
    #[case("application/pdf", AttachmentKind::Binary)]
    #[case("text/csv", AttachmentKind::Binary)]
    fn test_classify(#[case] content_type: &str, #[case] expected: AttachmentKind) {
        let mime: Mime = content_type.parse().unwrap();
        assert_eq!(classify(&mime), expected);
    }

    #[test]
    fn test_header_encoding() {
        assert_eq!(encode_header("Weekly report"), "Weekly report");

        let encoded = encode_header("Ваш план питания на неделю готов");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.split(' ').all(|word| word.len() <= 75));
    }

    #[test]
    fn test_filename_params() {
        assert_eq!(filename_param("filename", "menu.pdf"), "filename=\"menu.pdf\"");
        assert_eq!(filename_param("name", "a\"b.pdf"), "name=\"a\\\"b.pdf\"");
        assert_eq!(filename_param("filename", "menú.pdf"), "filename*=UTF-8''men%C3%BA.pdf");
    }

    #[test]
    fn test_fold_header() {
        let long = format!("Subject: {}", "word ".repeat(30));
        let folded = fold_header(long.trim_end());
        assert!(folded.split("\r\n").all(|line| line.len() <= 78));
        assert!(folded.contains("\r\n "));
    }

    #[test]
    fn test_header_rejects_line_breaks() {
        let encoder = MimeEncoder::default();
        let mut output = Vec::new();
        let err = encoder
            .write_header(&mut output, "Subject", "hi\r\nBcc: x@example.com")
            .unwrap_err();
        assert_eq!(err.kind(), MailErrorKind::InvalidHeader);
    }

    #[test]
    fn test_message_id_generation() {
        let encoder = MimeEncoder::new("eatsmart.app");
        let a = encoder.generate_message_id();
        let b = encoder.generate_message_id();
        assert!(a.ends_with("@eatsmart.app"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_dot_stuffing() {
        let output = MimeEncoder::prepare_data_content(b"Hello\r\n.World\r\n..Test\r\n");
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("\r\n..World"));
        assert!(output.contains("\r\n...Test"));
        assert!(output.ends_with("\r\n.\r\n"));

        let output = MimeEncoder::prepare_data_content(b"no trailing newline");
        assert_eq!(output, b"no trailing newline\r\n.\r\n");
    }

    #[test]
    fn test_plain_message_encoding() {
        let message = Message::new(
            Address::sender("EatSmart Assistant", "bot@eatsmart.app").unwrap(),
            vec![
                Address::new("a@example.com").unwrap(),
                Address::new("b@example.com").unwrap(),
            ],
            "Your plan",
            "Hello World",
            BodySubtype::Plain,
        )
        .unwrap();

        let encoded = MimeEncoder::new("eatsmart.app").encode(&message, "id-1@eatsmart.app").unwrap();
        let content = String::from_utf8(encoded).unwrap();

        assert!(content.contains("From: EatSmart Assistant <bot@eatsmart.app>\r\n"));
        assert!(content.contains("To: a@example.com, b@example.com\r\n"));
        assert!(content.contains("Subject: Your plan\r\n"));
        assert!(content.contains("Message-ID: <id-1@eatsmart.app>\r\n"));
        assert!(content.contains("MIME-Version: 1.0\r\n"));
        assert!(content.contains("Content-Type: multipart/mixed; boundary=\"----=_Part_"));
        assert!(content.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(content.contains("Hello World"));
        assert!(content.trim_end().ends_with("--"));
    }

    #[test]
    fn test_non_ascii_sender_name() {
        let from = Address::sender("Équipe EatSmart", "bot@eatsmart.app").unwrap();
        let formatted = format_address(&from);
        assert!(formatted.starts_with("=?UTF-8?B?"));
        assert!(formatted.ends_with(" <bot@eatsmart.app>"));
    }
}
