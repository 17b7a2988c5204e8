//! Yahoo mailboxes: OpenID userinfo for the account, IMAP with XOAUTH2 for mail.

use anyhow::{anyhow, Context, Result};
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::StreamExt;
use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{ImapEndpoint, ProviderConfig};
use crate::connectors::filters::imap_filter;
use crate::connectors::http::fetch_text;
use crate::connectors::{
    AttachmentBlob, AttachmentDescriptor, MailProvider, MailSession, ProviderMessage,
};
use crate::db::models::{Lab, MailboxToken, Provider};
use crate::error::IngestError;

const MAILBOX: &str = "INBOX";
const HEADER_FETCH_CHUNK: usize = 50;

type AsyncTcpStream = async_io::Async<std::net::TcpStream>;
type TlsStream = async_native_tls::TlsStream<AsyncTcpStream>;
type ImapSession = async_imap::Session<TlsStream>;

struct XOAuth2Authenticator {
    response: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _data: &[u8]) -> Self::Response {
        std::mem::take(&mut self.response)
    }
}

fn xoauth2_response(user: &str, access_token: &str) -> String {
    STANDARD.encode(format!("user={user}\x01auth=Bearer {access_token}\x01\x01"))
}

#[derive(Debug, Clone)]
pub struct YahooImapClient {
    client: Client,
    userinfo_base: String,
    imap: ImapEndpoint,
}

impl YahooImapClient {
    pub fn new(client: Client, userinfo_base: &str, imap: ImapEndpoint) -> Self {
        Self {
            client,
            userinfo_base: userinfo_base.trim_end_matches('/').to_string(),
            imap,
        }
    }

    pub fn from_config(client: Client, config: &ProviderConfig) -> Result<Self, IngestError> {
        let imap = config.imap.clone().ok_or_else(|| {
            IngestError::Config(format!("{} has no IMAP endpoint configured", config.provider))
        })?;
        Ok(Self::new(client, &config.api_base, imap))
    }

    async fn connect(&self, session: &MailSession) -> Result<ImapSession> {
        let addr = format!("{}:{}", self.imap.host, self.imap.port);
        debug!(%addr, "connecting to imap server");

        let std_stream =
            std::net::TcpStream::connect(&addr).with_context(|| format!("connect {addr}"))?;
        std_stream
            .set_nonblocking(true)
            .context("set imap socket non-blocking")?;
        let tcp_stream = async_io::Async::new(std_stream).context("register imap socket")?;

        let tls_stream = TlsConnector::new()
            .connect(&self.imap.host, tcp_stream)
            .await
            .with_context(|| format!("tls handshake with {}", self.imap.host))?;

        let client = async_imap::Client::new(tls_stream);
        let authenticator = XOAuth2Authenticator {
            response: xoauth2_response(&session.account_email, &session.access_token),
        };
        let mut imap = client
            .authenticate("XOAUTH2", authenticator)
            .await
            .map_err(|(e, _)| anyhow!("imap XOAUTH2 rejected: {e}"))?;

        imap.examine(MAILBOX)
            .await
            .with_context(|| format!("examine {MAILBOX}"))?;
        Ok(imap)
    }

    async fn search_headers(
        &self,
        session: &MailSession,
        filter: &str,
    ) -> Result<Vec<ProviderMessage>> {
        let mut imap = self.connect(session).await?;

        let mut uids: Vec<u32> = imap
            .uid_search(filter)
            .await
            .context("imap uid search")?
            .into_iter()
            .collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        debug!(account = %session.account_email, matches = uids.len(), "imap search complete");

        let mut messages = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(HEADER_FETCH_CHUNK) {
            let uid_set = chunk
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let mut fetches = imap
                .uid_fetch(&uid_set, "(UID BODY.PEEK[HEADER])")
                .await
                .context("imap uid fetch headers")?;
            while let Some(fetch) = fetches.next().await {
                let fetch = fetch.context("imap header response")?;
                match (fetch.uid, fetch.header()) {
                    (Some(uid), Some(header)) => messages.push(map_header_block(uid, header)),
                    _ => warn!("imap fetch response missing uid or header"),
                }
            }
        }

        // Newest first, regardless of the order the server streamed them back.
        messages.sort_by_key(|message| {
            std::cmp::Reverse(message.message_id.parse::<u32>().unwrap_or_default())
        });

        if let Err(error) = imap.logout().await {
            warn!(%error, "imap logout failed");
        }
        Ok(messages)
    }

    async fn fetch_raw_message(&self, session: &MailSession, uid: u32) -> Result<Vec<u8>> {
        let mut imap = self.connect(session).await?;
        let raw = {
            let mut fetches = imap
                .uid_fetch(uid.to_string(), "BODY.PEEK[]")
                .await
                .context("imap uid fetch body")?;
            let fetch = fetches
                .next()
                .await
                .ok_or_else(|| anyhow!("message with UID {uid} not found"))?
                .context("imap body response")?;
            fetch
                .body()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| anyhow!("message with UID {uid} has no body"))?
        };

        if let Err(error) = imap.logout().await {
            warn!(%error, "imap logout failed");
        }
        Ok(raw)
    }
}

#[async_trait]
impl MailProvider for YahooImapClient {
    fn kind(&self) -> Provider {
        Provider::Yahoo
    }

    fn build_filter(&self, labs: &[Lab]) -> Result<String, IngestError> {
        imap_filter(labs)
    }

    async fn resolve_account(&self, token: &MailboxToken) -> Result<MailSession, IngestError> {
        let url = format!("{}/userinfo", self.userinfo_base);
        let body = fetch_text(&self.client, &token.access_token, &url)
            .await
            .map_err(|e| IngestError::AccountResolution(format!("yahoo userinfo: {e:#}")))?;
        let userinfo: YahooUserInfo = serde_json::from_str(&body)
            .map_err(|e| IngestError::AccountResolution(format!("decode yahoo userinfo: {e}")))?;

        let account_email = userinfo
            .email
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty())
            .ok_or_else(|| {
                IngestError::AccountResolution("yahoo userinfo has no email claim".to_string())
            })?;

        Ok(MailSession {
            access_token: token.access_token.clone(),
            account_email,
        })
    }

    async fn search(
        &self,
        session: &MailSession,
        filter: &str,
    ) -> Result<Vec<ProviderMessage>, IngestError> {
        let messages = self
            .search_headers(session, filter)
            .await
            .map_err(|e| IngestError::Search(format!("yahoo imap: {e:#}")))?;
        info!(account = %session.account_email, count = messages.len(), "yahoo messages found");
        Ok(messages)
    }

    async fn list_attachments(
        &self,
        session: &MailSession,
        message: &ProviderMessage,
    ) -> Result<Vec<AttachmentDescriptor>, IngestError> {
        let fetch_error = |detail: String| IngestError::AttachmentFetch {
            message_id: message.message_id.clone(),
            detail,
        };

        let uid = message
            .message_id
            .parse::<u32>()
            .map_err(|_| fetch_error(format!("not an IMAP UID: {}", message.message_id)))?;
        let raw = self
            .fetch_raw_message(session, uid)
            .await
            .map_err(|e| fetch_error(format!("{e:#}")))?;

        extract_attachments(&raw, uid).ok_or_else(|| fetch_error("unparseable message".to_string()))
    }

    async fn download_attachment(
        &self,
        _session: &MailSession,
        message: &ProviderMessage,
        descriptor: &AttachmentDescriptor,
    ) -> Result<AttachmentBlob, IngestError> {
        descriptor
            .inline_blob(&message.message_id)
            .ok_or_else(|| IngestError::AttachmentFetch {
                message_id: message.message_id.clone(),
                detail: format!("attachment {} was not listed with content", descriptor.attachment_id),
            })
    }
}

fn map_header_block(uid: u32, header: &[u8]) -> ProviderMessage {
    let parsed = MessageParser::default().parse_headers(header);
    let Some(message) = parsed else {
        return ProviderMessage {
            message_id: uid.to_string(),
            sender: None,
            subject: None,
            received_at: None,
            has_attachments: false,
            snippet: None,
            attachments: Vec::new(),
        };
    };

    let has_attachments = message
        .parts
        .first()
        .and_then(|part| part.content_type())
        .is_some_and(|ct| {
            ct.ctype().eq_ignore_ascii_case("multipart")
                && ct
                    .subtype()
                    .is_some_and(|subtype| subtype.eq_ignore_ascii_case("mixed"))
        });

    ProviderMessage {
        message_id: uid.to_string(),
        sender: sender_address(&message),
        subject: message.subject().map(str::to_string),
        received_at: message.date().map(|d| d.to_rfc3339()),
        has_attachments,
        snippet: None,
        attachments: Vec::new(),
    }
}

fn sender_address(message: &Message<'_>) -> Option<String> {
    let addr = message.from().and_then(|addr| addr.first())?;
    addr.address()
        .or_else(|| addr.name())
        .map(str::to_string)
}

/// Attachment parts of a raw RFC 822 message, with their content already decoded.
fn extract_attachments(raw: &[u8], uid: u32) -> Option<Vec<AttachmentDescriptor>> {
    let message = MessageParser::default().parse(raw)?;
    let mut descriptors = Vec::new();

    for (index, part) in message.parts.iter().enumerate() {
        if !is_attachment(part) {
            continue;
        }
        let content = match &part.body {
            PartType::Binary(data) | PartType::InlineBinary(data) => data.to_vec(),
            PartType::Text(text) => text.as_bytes().to_vec(),
            PartType::Html(html) => html.as_bytes().to_vec(),
            _ => continue,
        };

        let mime_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let file_name = part
            .attachment_name()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| fallback_file_name(index, &mime_type));

        descriptors.push(AttachmentDescriptor {
            attachment_id: format!("{uid}.{index}"),
            file_name,
            mime_type,
            size: Some(content.len() as i64),
            inline_data: Some(content),
            listed_inline: true,
        });
    }

    Some(descriptors)
}

fn is_attachment(part: &MessagePart<'_>) -> bool {
    if part
        .content_disposition()
        .is_some_and(|disposition| disposition.ctype().eq_ignore_ascii_case("attachment"))
    {
        return true;
    }
    if part.attachment_name().is_some() {
        return true;
    }

    // Bare non-text leaves (application/pdf without a name, images) count too.
    part.content_type().is_some_and(|ct| {
        let ctype = ct.ctype();
        !matches!(ctype, "text" | "multipart" | "message") && ct.subtype().is_some()
    })
}

fn fallback_file_name(index: usize, mime_type: &str) -> String {
    let extension = mime_type
        .split_once('/')
        .map(|(_, subtype)| subtype)
        .filter(|subtype| !subtype.is_empty())
        .unwrap_or("bin");
    format!("attachment-{index}.{extension}")
}

#[derive(Debug, Clone, Deserialize)]
struct YahooUserInfo {
    email: Option<String>,
}
