use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use crate::connectors::filters::graph_filter;
use crate::connectors::http::{fetch_bytes, fetch_text};
use crate::connectors::{
    AttachmentBlob, AttachmentDescriptor, MailProvider, MailSession, ProviderMessage,
};
use crate::db::models::{Lab, MailboxToken, Provider};
use crate::error::IngestError;

const SEARCH_PAGE_SIZE: usize = 50;
const MESSAGE_SELECT: &str = "id,subject,from,receivedDateTime,hasAttachments,bodyPreview";
const ATTACHMENT_SELECT: &str = "id,name,contentType,size,isInline";

#[derive(Debug, Clone)]
pub struct GraphClient {
    client: Client,
    api_base: String,
}

impl GraphClient {
    pub fn new(client: Client, api_base: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// `api_base` plus one percent-encoded path segment per item; ids may hold `/`.
    fn resource_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)
            .with_context(|| format!("parse graph api base {}", self.api_base))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("graph api base {} cannot carry a path", self.api_base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn initial_search_url(&self, filter: &str) -> Result<String> {
        let mut url = self
            .resource_url(&["me", "messages"])
            .context("build graph messages url")?;
        url.query_pairs_mut()
            .append_pair("$filter", filter)
            .append_pair("$select", MESSAGE_SELECT)
            .append_pair("$top", &SEARCH_PAGE_SIZE.to_string());
        Ok(url.to_string())
    }

    async fn get_me(&self, token: &str) -> Result<GraphUser> {
        let url = format!("{}/me", self.api_base);
        let body = fetch_text(&self.client, token, &url).await?;
        serde_json::from_str(&body).context("decode graph user")
    }

    async fn fetch_messages_page(&self, token: &str, url: &str) -> Result<GraphMessagesPage> {
        let body = fetch_text(&self.client, token, url).await?;
        serde_json::from_str(&body).context("decode graph messages page JSON")
    }

    async fn fetch_attachments(
        &self,
        token: &str,
        message_id: &str,
    ) -> Result<Vec<GraphAttachment>> {
        let mut url = self.resource_url(&["me", "messages", message_id, "attachments"])?;
        url.set_query(Some(&format!("$select={ATTACHMENT_SELECT}")));
        let body = fetch_text(&self.client, token, url.as_str()).await?;
        let page: GraphAttachmentPage =
            serde_json::from_str(&body).context("decode graph attachments JSON")?;
        Ok(page.value)
    }
}

#[async_trait]
impl MailProvider for GraphClient {
    fn kind(&self) -> Provider {
        Provider::Outlook
    }

    fn build_filter(&self, labs: &[Lab]) -> Result<String, IngestError> {
        graph_filter(labs)
    }

    async fn resolve_account(&self, token: &MailboxToken) -> Result<MailSession, IngestError> {
        let me = self
            .get_me(&token.access_token)
            .await
            .map_err(|e| IngestError::AccountResolution(format!("graph /me: {e:#}")))?;

        let account_email = me
            .mail
            .or(me.user_principal_name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                IngestError::AccountResolution("graph /me returned no mailbox address".to_string())
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
        let mut next_url = Some(
            self.initial_search_url(filter)
                .map_err(|e| IngestError::Search(format!("{e:#}")))?,
        );
        let mut messages = Vec::new();
        let mut page_number = 0u64;

        while let Some(url) = next_url.take() {
            let page = self
                .fetch_messages_page(&session.access_token, &url)
                .await
                .map_err(|e| IngestError::Search(format!("graph messages page: {e:#}")))?;
            page_number += 1;

            messages.extend(page.value.into_iter().filter_map(map_graph_message));
            next_url = page.next_link;
        }

        debug!(
            account = %session.account_email,
            pages = page_number,
            matches = messages.len(),
            "graph search complete"
        );
        Ok(messages)
    }

    async fn list_attachments(
        &self,
        session: &MailSession,
        message: &ProviderMessage,
    ) -> Result<Vec<AttachmentDescriptor>, IngestError> {
        let attachments = self
            .fetch_attachments(&session.access_token, &message.message_id)
            .await
            .map_err(|e| IngestError::AttachmentFetch {
                message_id: message.message_id.clone(),
                detail: format!("{e:#}"),
            })?;

        Ok(attachments
            .into_iter()
            .filter(|attachment| !attachment.is_inline.unwrap_or(false))
            .map(|attachment| AttachmentDescriptor {
                file_name: attachment
                    .name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| attachment.id.clone()),
                attachment_id: attachment.id,
                mime_type: attachment
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: attachment.size,
                inline_data: None,
                listed_inline: false,
            })
            .collect())
    }

    async fn download_attachment(
        &self,
        session: &MailSession,
        message: &ProviderMessage,
        descriptor: &AttachmentDescriptor,
    ) -> Result<AttachmentBlob, IngestError> {
        let fetch_failed = |e: anyhow::Error| IngestError::AttachmentFetch {
            message_id: message.message_id.clone(),
            detail: format!("{e:#}"),
        };
        let url = self
            .resource_url(&[
                "me",
                "messages",
                message.message_id.as_str(),
                "attachments",
                descriptor.attachment_id.as_str(),
                "$value",
            ])
            .map_err(fetch_failed)?;
        let content = fetch_bytes(&self.client, &session.access_token, url.as_str())
            .await
            .map_err(fetch_failed)?;

        Ok(AttachmentBlob {
            file_name: descriptor.file_name.clone(),
            content,
            mime_type: descriptor.mime_type.clone(),
            message_id: message.message_id.clone(),
            attachment_id: descriptor.attachment_id.clone(),
        })
    }
}

fn map_graph_message(message: GraphMessage) -> Option<ProviderMessage> {
    let message_id = message.id?;
    let sender = message.from.as_ref().and_then(GraphRecipient::address_or_name);

    Some(ProviderMessage {
        message_id,
        sender,
        subject: message.subject,
        received_at: message.received_date_time,
        has_attachments: message.has_attachments.unwrap_or(false),
        snippet: message.body_preview,
        attachments: Vec::new(),
    })
}

// --- Graph API response types ---

#[derive(Debug, Clone, Deserialize)]
struct GraphUser {
    mail: Option<String>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessagesPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessage {
    id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(rename = "bodyPreview")]
    body_preview: Option<String>,
    #[serde(rename = "hasAttachments")]
    has_attachments: Option<bool>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

impl GraphRecipient {
    fn address_or_name(&self) -> Option<String> {
        let email = self.email_address.as_ref()?;
        [email.address.as_deref(), email.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphAttachmentPage {
    value: Vec<GraphAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphAttachment {
    id: String,
    name: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    size: Option<i64>,
    #[serde(rename = "isInline")]
    is_inline: Option<bool>,
}
