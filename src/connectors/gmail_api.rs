use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use crate::connectors::filters::gmail_filter;
use crate::connectors::http::fetch_text;
use crate::connectors::{
    AttachmentBlob, AttachmentDescriptor, MailProvider, MailSession, ProviderMessage,
};
use crate::db::models::{Lab, MailboxToken, Provider};
use crate::decoder::{decode_bytes, walk_parts, BodyPart};
use crate::error::IngestError;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct GmailClient {
    client: Client,
    api_base: String,
}

impl GmailClient {
    pub fn new(client: Client, api_base: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn get_profile(&self, token: &str) -> Result<GmailProfile> {
        let url = format!("{}/users/me/profile", self.api_base);
        let body = fetch_text(&self.client, token, &url).await?;
        serde_json::from_str(&body).context("decode gmail profile")
    }

    async fn list_message_ids(
        &self,
        token: &str,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<GmailMessageList> {
        let mut url = Url::parse(&format!("{}/users/me/messages", self.api_base))
            .context("build gmail messages url")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", query)
                .append_pair("maxResults", &DEFAULT_PAGE_SIZE.to_string());
            if let Some(pt) = page_token {
                pairs.append_pair("pageToken", pt);
            }
        }
        let body = fetch_text(&self.client, token, url.as_str()).await?;
        serde_json::from_str(&body).context("decode gmail message list")
    }

    async fn get_message(&self, token: &str, message_id: &str) -> Result<GmailMessage> {
        let url = format!(
            "{}/users/me/messages/{message_id}?format=full",
            self.api_base
        );
        let body = fetch_text(&self.client, token, &url).await?;
        serde_json::from_str(&body).context("decode gmail message")
    }

    async fn get_attachment(
        &self,
        token: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<GmailAttachmentBody> {
        let url = format!(
            "{}/users/me/messages/{message_id}/attachments/{attachment_id}",
            self.api_base
        );
        let body = fetch_text(&self.client, token, &url).await?;
        serde_json::from_str(&body).context("decode gmail attachment body")
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    fn kind(&self) -> Provider {
        Provider::Gmail
    }

    fn build_filter(&self, labs: &[Lab]) -> Result<String, IngestError> {
        gmail_filter(labs)
    }

    async fn resolve_account(&self, token: &MailboxToken) -> Result<MailSession, IngestError> {
        let profile = self
            .get_profile(&token.access_token)
            .await
            .map_err(|e| IngestError::AccountResolution(format!("gmail profile: {e:#}")))?;

        Ok(MailSession {
            access_token: token.access_token.clone(),
            account_email: profile.email_address,
        })
    }

    async fn search(
        &self,
        session: &MailSession,
        filter: &str,
    ) -> Result<Vec<ProviderMessage>, IngestError> {
        let token = session.access_token.as_str();
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let list = self
                .list_message_ids(token, filter, page_token.as_deref())
                .await
                .map_err(|e| IngestError::Search(format!("gmail messages.list: {e:#}")))?;
            ids.extend(list.messages.unwrap_or_default().into_iter().map(|stub| stub.id));

            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        debug!(account = %session.account_email, matches = ids.len(), "gmail search complete");

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let message = self
                .get_message(token, &id)
                .await
                .map_err(|e| IngestError::Search(format!("gmail messages.get id={id}: {e:#}")))?;
            messages.push(map_gmail_message(&message));
        }
        Ok(messages)
    }

    async fn list_attachments(
        &self,
        session: &MailSession,
        message: &ProviderMessage,
    ) -> Result<Vec<AttachmentDescriptor>, IngestError> {
        if !message.attachments.is_empty() {
            return Ok(message.attachments.clone());
        }

        let full = self
            .get_message(&session.access_token, &message.message_id)
            .await
            .map_err(|e| IngestError::AttachmentFetch {
                message_id: message.message_id.clone(),
                detail: format!("{e:#}"),
            })?;
        let mut descriptors = Vec::new();
        collect_attachments(&full.payload, &mut descriptors);
        Ok(descriptors)
    }

    async fn download_attachment(
        &self,
        session: &MailSession,
        message: &ProviderMessage,
        descriptor: &AttachmentDescriptor,
    ) -> Result<AttachmentBlob, IngestError> {
        if descriptor.listed_inline {
            return descriptor
                .inline_blob(&message.message_id)
                .ok_or_else(|| IngestError::Decode {
                    file_name: descriptor.file_name.clone(),
                });
        }

        let body = self
            .get_attachment(
                &session.access_token,
                &message.message_id,
                &descriptor.attachment_id,
            )
            .await
            .map_err(|e| IngestError::AttachmentFetch {
                message_id: message.message_id.clone(),
                detail: format!("{e:#}"),
            })?;

        let content = body
            .data
            .as_deref()
            .and_then(decode_bytes)
            .ok_or_else(|| IngestError::Decode {
                file_name: descriptor.file_name.clone(),
            })?;

        Ok(AttachmentBlob {
            file_name: descriptor.file_name.clone(),
            content,
            mime_type: descriptor.mime_type.clone(),
            message_id: message.message_id.clone(),
            attachment_id: descriptor.attachment_id.clone(),
        })
    }
}

fn map_gmail_message(message: &GmailMessage) -> ProviderMessage {
    let payload = &message.payload;
    let subject = extract_header(payload, "Subject");
    let (from_name, from_address) = parse_from_header(extract_header(payload, "From").as_deref());

    // internalDate is epoch millis; the Date header is only a fallback.
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms_str| ms_str.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|dt| dt.to_rfc3339())
        .or_else(|| {
            extract_header(payload, "Date").and_then(|d| {
                DateTime::parse_from_rfc2822(&d)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
            })
        });

    let snippet = message
        .snippet
        .as_deref()
        .map(html_entity_decode)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            let body = walk_parts(std::slice::from_ref(payload));
            (!body.is_empty()).then_some(body)
        });

    let mut attachments = Vec::new();
    collect_attachments(payload, &mut attachments);

    ProviderMessage {
        message_id: message.id.clone(),
        sender: from_address.or(from_name),
        subject,
        received_at,
        has_attachments: !attachments.is_empty(),
        snippet,
        attachments,
    }
}

/// Parts with a filename and either an attachment id or inline data, depth-first.
fn collect_attachments(payload: &GmailPayload, out: &mut Vec<AttachmentDescriptor>) {
    let file_name = payload
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    if let (Some(file_name), Some(body)) = (file_name, payload.body.as_ref()) {
        let listed_inline = body.attachment_id.is_none() && body.data.is_some();
        let inline_data = match body.attachment_id {
            Some(_) => None,
            None => body.data.as_deref().and_then(decode_bytes),
        };
        let attachment_id = match &body.attachment_id {
            Some(id) => Some(id.clone()),
            None if listed_inline => payload.part_id.clone(),
            None => None,
        };

        if let Some(attachment_id) = attachment_id {
            out.push(AttachmentDescriptor {
                attachment_id,
                file_name: file_name.to_string(),
                mime_type: payload
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: body.size.map(|size| size as i64),
                inline_data,
                listed_inline,
            });
        }
    }

    for part in payload.parts.as_deref().unwrap_or_default() {
        collect_attachments(part, out);
    }
}

fn extract_header(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn parse_from_header(raw: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return (None, None);
    };

    // Pattern: "Display Name <email@example.com>"
    if let (Some(angle_start), Some(angle_end)) = (raw.rfind('<'), raw.rfind('>')) {
        if angle_start < angle_end {
            let address = raw[angle_start + 1..angle_end].trim();
            let name = raw[..angle_start].trim().trim_matches('"').trim();
            return (
                Some(name.to_string()).filter(|n| !n.is_empty()),
                Some(address.to_string()).filter(|a| !a.is_empty()),
            );
        }
    }

    if raw.contains('@') {
        return (None, Some(raw.to_string()));
    }
    (Some(raw.to_string()), None)
}

fn html_entity_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
}

// --- Gmail API response types ---

#[derive(Debug, Clone, Deserialize)]
struct GmailProfile {
    #[serde(rename = "emailAddress")]
    email_address: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageStub {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessage {
    id: String,
    snippet: Option<String>,
    payload: GmailPayload,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailPayload {
    #[serde(rename = "partId")]
    part_id: Option<String>,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
    filename: Option<String>,
}

impl BodyPart for GmailPayload {
    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    fn body_data(&self) -> Option<&str> {
        self.body.as_ref().and_then(|body| body.data.as_deref())
    }

    fn children(&self) -> &[Self] {
        self.parts.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailBody {
    size: Option<u64>,
    data: Option<String>,
    #[serde(rename = "attachmentId")]
    attachment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailAttachmentBody {
    data: Option<String>,
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde_json::json;

    use super::{html_entity_decode, map_gmail_message, parse_from_header, GmailClient, GmailMessage};
    use crate::connectors::{MailProvider, MailSession};
    use crate::error::IngestError;

    fn message(value: serde_json::Value) -> GmailMessage {
        serde_json::from_value(value).expect("valid gmail message json")
    }

    #[test]
    fn parse_from_header_splits_name_and_address() {
        assert_eq!(
            parse_from_header(Some("\"Acme Labs\" <results@acme.test>")),
            (
                Some("Acme Labs".to_string()),
                Some("results@acme.test".to_string())
            )
        );
        assert_eq!(
            parse_from_header(Some("results@acme.test")),
            (None, Some("results@acme.test".to_string()))
        );
        assert_eq!(parse_from_header(Some("  ")), (None, None));
    }

    #[test]
    fn html_entities_in_snippets_are_decoded() {
        assert_eq!(html_entity_decode("Tom &amp; Jerry&#39;s"), "Tom & Jerry's");
    }

    #[test]
    fn message_maps_headers_and_attachment_parts() {
        let mapped = map_gmail_message(&message(json!({
            "id": "m1",
            "snippet": "Your results &amp; notes",
            "internalDate": "1700000000000",
            "payload": {
                "partId": "",
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "Subject", "value": "Blood Panel"},
                    {"name": "From", "value": "Acme Labs <results@acme.test>"}
                ],
                "parts": [
                    {"partId": "0", "mimeType": "text/plain", "filename": "",
                     "body": {"size": 5, "data": URL_SAFE_NO_PAD.encode("hello")}},
                    {"partId": "1", "mimeType": "application/pdf", "filename": "report.pdf",
                     "body": {"size": 500000, "attachmentId": "att-1"}},
                    {"partId": "2", "mimeType": "text/csv", "filename": "values.csv",
                     "body": {"size": 3, "data": URL_SAFE_NO_PAD.encode("a,b")}}
                ]
            }
        })));

        assert_eq!(mapped.message_id, "m1");
        assert_eq!(mapped.subject.as_deref(), Some("Blood Panel"));
        assert_eq!(mapped.sender.as_deref(), Some("results@acme.test"));
        assert_eq!(mapped.snippet.as_deref(), Some("Your results & notes"));
        assert!(mapped
            .received_at
            .as_deref()
            .is_some_and(|ts| ts.starts_with("2023-11-14")));
        assert!(mapped.has_attachments);
        assert_eq!(mapped.attachments.len(), 2);

        let pdf = &mapped.attachments[0];
        assert_eq!(pdf.attachment_id, "att-1");
        assert_eq!(pdf.size, Some(500_000));
        assert!(pdf.inline_data.is_none());

        let csv = &mapped.attachments[1];
        assert_eq!(csv.attachment_id, "2");
        assert_eq!(csv.inline_data.as_deref(), Some(&b"a,b"[..]));
    }

    #[test]
    fn empty_snippet_falls_back_to_body_text() {
        let mapped = map_gmail_message(&message(json!({
            "id": "m2",
            "snippet": "",
            "payload": {
                "mimeType": "multipart/alternative",
                "parts": [
                    {"mimeType": "text/html",
                     "body": {"data": URL_SAFE_NO_PAD.encode("<p>Ready</p>")}}
                ]
            }
        })));
        assert!(mapped.snippet.as_deref().is_some_and(|s| s.contains("Ready")));
        assert!(!mapped.has_attachments);
        assert!(mapped.received_at.is_none());
    }

    #[tokio::test]
    async fn undecodable_inline_part_fails_as_decode_error() {
        let mapped = map_gmail_message(&message(json!({
            "id": "m3",
            "payload": {
                "mimeType": "multipart/mixed",
                "parts": [
                    {"partId": "1", "mimeType": "text/csv", "filename": "values.csv",
                     "body": {"size": 3, "data": "%%%"}}
                ]
            }
        })));
        assert!(mapped.has_attachments);
        let csv = &mapped.attachments[0];
        assert_eq!(csv.attachment_id, "1");
        assert!(csv.listed_inline);
        assert!(csv.inline_data.is_none());

        let gmail = GmailClient::new(reqwest::Client::new(), "http://127.0.0.1:9");
        let session = MailSession {
            access_token: "access-1".to_string(),
            account_email: "patient@mail.test".to_string(),
        };
        let error = gmail
            .download_attachment(&session, &mapped, csv)
            .await
            .expect_err("undecodable part must fail");
        assert!(matches!(error, IngestError::Decode { ref file_name } if file_name == "values.csv"));
        assert!(!error.is_fatal());
    }
}
