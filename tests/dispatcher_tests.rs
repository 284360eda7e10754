//! Tests for the email dispatcher against the mock transport.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use eatsmart_core::mocks::MockConnector;
use eatsmart_core::types::AttachmentSpec;
use eatsmart_core::{EmailDispatcher, EmailSettings, MailErrorKind, Settings, SmtpCommand};
use secrecy::SecretString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake image payload";
const PDF_BYTES: &[u8] = b"%PDF-1.4 fake report";

fn tls_settings() -> Arc<Settings> {
    Arc::new(Settings {
        email: EmailSettings {
            smtp_server: "smtp.test".to_string(),
            username: "bot@eatsmart.app".to_string(),
            password: Some(SecretString::new("hunter2".to_string())),
            ..EmailSettings::default()
        },
        ..Settings::default()
    })
}

fn dispatcher() -> EmailDispatcher<MockConnector> {
    EmailDispatcher::with_connector(tls_settings(), MockConnector::new()).unwrap()
}

fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn sent_text(dispatcher: &EmailDispatcher<MockConnector>) -> String {
    let data = dispatcher.connector().transport().received_data();
    assert_eq!(data.len(), 1, "expected exactly one DATA payload");
    String::from_utf8(data[0].clone()).unwrap()
}

#[tokio::test]
async fn test_send_issues_commands_in_order() {
    let dispatcher = dispatcher();
    dispatcher
        .send("Weekly plan", "<p>Hello</p>", &["a@example.com", "b@example.com"], &[])
        .await
        .unwrap();

    let mock = dispatcher.connector().transport();
    assert_eq!(
        mock.recorded_verbs(),
        ["EHLO", "STARTTLS", "EHLO", "AUTH", "MAIL", "RCPT", "RCPT", "DATA", "QUIT"]
    );

    let recipients: Vec<String> = mock
        .recorded_commands()
        .into_iter()
        .filter_map(|command| match command {
            SmtpCommand::RcptTo { address } => Some(address),
            _ => None,
        })
        .collect();
    assert_eq!(recipients, ["<a@example.com>", "<b@example.com>"]);
    assert_eq!(mock.closes(), 1);
}

#[tokio::test]
async fn test_display_name_recipient() {
    let dispatcher = dispatcher();
    dispatcher
        .send("Hi", "Hi", &["Bob <bob@example.com>", "carol@example.com"], &[])
        .await
        .unwrap();

    let recipients: Vec<String> = dispatcher
        .connector()
        .transport()
        .recorded_commands()
        .into_iter()
        .filter_map(|command| match command {
            SmtpCommand::RcptTo { address } => Some(address),
            _ => None,
        })
        .collect();
    assert_eq!(recipients, ["<bob@example.com>", "<carol@example.com>"]);

    let text = sent_text(&dispatcher);
    assert!(text.contains("To: Bob <bob@example.com>, carol@example.com\r\n"));
}

#[tokio::test]
async fn test_message_headers_and_body() {
    let dispatcher = dispatcher();
    dispatcher
        .send("Weekly plan", "<p>Hello</p>", &["b@example.com", "a@example.com"], &[])
        .await
        .unwrap();

    let text = sent_text(&dispatcher);
    assert!(text.contains("From: EatSmart Assistant <bot@eatsmart.app>\r\n"));
    assert!(text.contains("To: b@example.com, a@example.com\r\n"));
    assert!(text.contains("Subject: Weekly plan\r\n"));
    assert!(text.contains("MIME-Version: 1.0\r\n"));
    assert!(text.contains("Content-Type: multipart/mixed;"));
    assert!(text.contains("Content-Type: text/html; charset=utf-8\r\n"));
    assert!(text.contains("<p>Hello</p>"));
}

#[tokio::test]
async fn test_image_is_inline_and_pdf_is_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_file(dir.path(), "chart.png", PNG_BYTES);
    let report = write_file(dir.path(), "report-2024.pdf", PDF_BYTES);

    let dispatcher = dispatcher();
    dispatcher
        .send_with_attachments(
            "Report",
            "<p>See attached</p>",
            &["a@example.com"],
            &[
                AttachmentSpec::new("nutrition.png", &image),
                AttachmentSpec::new("report.pdf", &report),
            ],
        )
        .await
        .unwrap();

    let text = sent_text(&dispatcher);
    assert!(text.contains("Content-Type: image/png; name=\"nutrition.png\"\r\n"));
    assert!(text.contains("Content-Disposition: inline; filename=\"nutrition.png\"\r\n"));
    assert!(text.contains("Content-ID: <nutrition.png>\r\n"));
    assert!(text.contains("Content-Type: application/pdf; name=\"report.pdf\"\r\n"));
    assert!(text.contains("Content-Disposition: attachment; filename=\"report.pdf\"\r\n"));
    assert!(text.contains(&BASE64.encode(PDF_BYTES)));

    let image_at = text.find("nutrition.png").unwrap();
    let pdf_at = text.find("report.pdf").unwrap();
    assert!(image_at < pdf_at, "attachments keep their order");
    assert_eq!(dispatcher.metrics().snapshot().attachments_loaded, 2);
}

#[tokio::test]
async fn test_missing_attachment_skips_network() {
    let dir = tempfile::tempdir().unwrap();
    let present = write_file(dir.path(), "chart.png", PNG_BYTES);
    let missing = dir.path().join("missing.pdf");

    let dispatcher = dispatcher();
    let err = dispatcher
        .send(
            "Report",
            "Body",
            &["a@example.com"],
            &[
                AttachmentSpec::from_path(&present),
                AttachmentSpec::from_path(&missing),
            ],
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), MailErrorKind::AttachmentNotFound);
    assert!(err.message().contains("missing.pdf"));
    assert_eq!(dispatcher.connector().connects(), 0);
    assert!(dispatcher.connector().transport().recorded_commands().is_empty());
    assert_eq!(dispatcher.metrics().snapshot().sends_failed, 1);
}

#[tokio::test]
async fn test_directory_is_not_an_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher();

    let err = dispatcher
        .send_with_pdf("Report", "Body", &["a@example.com"], dir.path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), MailErrorKind::AttachmentNotFound);
    assert_eq!(dispatcher.connector().connects(), 0);
}

#[tokio::test]
async fn test_send_with_image_matches_send() {
    let dir = tempfile::tempdir().unwrap();
    let photo = write_file(dir.path(), "photo.jpg", PNG_BYTES);

    let wrapped = dispatcher();
    wrapped
        .send_with_image("Meal", "<p>Dinner</p>", &["a@example.com"], &photo)
        .await
        .unwrap();

    let direct = dispatcher();
    direct
        .send(
            "Meal",
            "<p>Dinner</p>",
            &["a@example.com"],
            &[AttachmentSpec::new("photo.jpg", &photo)],
        )
        .await
        .unwrap();

    assert_eq!(
        wrapped.connector().transport().recorded_commands(),
        direct.connector().transport().recorded_commands()
    );

    let wrapped_text = sent_text(&wrapped);
    let direct_text = sent_text(&direct);
    assert_eq!(wrapped_text.len(), direct_text.len());
    for text in [&wrapped_text, &direct_text] {
        assert!(text.contains("Content-Type: image/jpeg; name=\"photo.jpg\"\r\n"));
        assert!(text.contains("Content-Disposition: inline; filename=\"photo.jpg\"\r\n"));
    }
}

#[tokio::test]
async fn test_send_with_excel_attaches_spreadsheet() {
    let dir = tempfile::tempdir().unwrap();
    let sheet = write_file(dir.path(), "macros.xlsx", b"PK\x03\x04 fake workbook");

    let dispatcher = dispatcher();
    dispatcher
        .send_with_excel("Macros", "Numbers attached", &["a@example.com"], &sheet)
        .await
        .unwrap();

    let text = sent_text(&dispatcher);
    // The Content-Type line is long enough to be folded before the name.
    assert!(text.contains(
        "Content-Type: application/vnd.openxmlformats-officedocument.spreadsheetml.sheet;"
    ));
    assert!(text.contains("name=\"macros.xlsx\""));
    assert!(text.contains("Content-Disposition: attachment; filename=\"macros.xlsx\"\r\n"));
}

#[tokio::test]
async fn test_compressed_file_is_octet_stream() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_file(dir.path(), "export.csv.gz", b"\x1f\x8b fake gzip");

    let dispatcher = dispatcher();
    dispatcher
        .send_with_pdf("Export", "Body", &["a@example.com"], &archive)
        .await
        .unwrap();

    let text = sent_text(&dispatcher);
    assert!(text.contains("Content-Type: application/octet-stream; name=\"export.csv.gz\"\r\n"));
    assert!(text.contains("Content-Disposition: attachment; filename=\"export.csv.gz\"\r\n"));
}

#[tokio::test]
async fn test_partial_refusal_is_tolerated() {
    let dispatcher = dispatcher();
    let mock = dispatcher.connector().transport();
    mock.reject_recipient("gone@example.com", 550, "5.1.1 User unknown");

    dispatcher
        .send("Hi", "Hi", &["a@example.com", "gone@example.com"], &[])
        .await
        .unwrap();

    assert_eq!(mock.received_data().len(), 1);
    assert_eq!(dispatcher.metrics().snapshot().recipients_rejected, 1);
}

#[tokio::test]
async fn test_total_refusal_fails() {
    let dispatcher = dispatcher();
    let mock = dispatcher.connector().transport();
    mock.reject_recipient("gone@example.com", 550, "5.1.1 User unknown");

    let err = dispatcher
        .send("Hi", "Hi", &["gone@example.com"], &[])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), MailErrorKind::RecipientsRejected);
    assert_eq!(err.smtp_code(), Some(550));
    assert!(mock.recorded_verbs().ends_with(&["RCPT", "RSET", "QUIT"]));
    assert!(mock.received_data().is_empty());
}

#[tokio::test]
async fn test_empty_recipients_is_invalid_argument() {
    let dispatcher = dispatcher();
    let err = dispatcher
        .send::<&str>("Hi", "Hi", &[], &[])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), MailErrorKind::NoRecipients);
    assert_eq!(dispatcher.connector().connects(), 0);
}

#[tokio::test]
async fn test_each_send_opens_its_own_session() {
    let dispatcher = dispatcher();
    for _ in 0..3 {
        dispatcher.send("Hi", "Hi", &["a@example.com"], &[]).await.unwrap();
    }

    assert_eq!(dispatcher.connector().connects(), 3);
    assert_eq!(dispatcher.connector().transport().closes(), 3);
    assert_eq!(dispatcher.connector().transport().tls_upgrades(), 3);
    assert_eq!(dispatcher.metrics().snapshot().sends_succeeded, 3);
}
