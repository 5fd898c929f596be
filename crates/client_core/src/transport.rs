use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{
        InboxResponse, LoginRequest, LoginResponse, MessageRecord, SendMessageRequest,
        USER_ID_HEADER,
    },
};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Full inbox for `user`, both directions, oldest first.
    async fn fetch_inbox(&self, user: &UserId) -> Result<Vec<MessageRecord>, TransportError>;
    async fn send_message(
        &self,
        from: &UserId,
        to: &UserId,
        content: &str,
    ) -> Result<(), TransportError>;
}

pub struct HttpMessageChannel {
    http: Client,
    base_url: Url,
}

impl HttpMessageChannel {
    /// `server_url` may carry a path prefix; routes are joined beneath it.
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        let mut base_url = Url::parse(server_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Registers `user` with the relay so it can send and receive.
    pub async fn login(&self, user: &UserId) -> Result<UserId, TransportError> {
        let response = self
            .http
            .post(self.base_url.join("api/login")?)
            .json(&LoginRequest {
                user_id: user.to_string(),
            })
            .send()
            .await?;
        let body: LoginResponse = check(response).await?.json().await?;
        debug!(user = %body.user_id, status = %body.status, "transport: logged in");
        Ok(body.user_id)
    }
}

#[async_trait]
impl MessageChannel for HttpMessageChannel {
    async fn fetch_inbox(&self, user: &UserId) -> Result<Vec<MessageRecord>, TransportError> {
        let response = self
            .http
            .get(self.base_url.join("api/messages")?)
            .header(USER_ID_HEADER, user.as_str())
            .send()
            .await?;
        let body: InboxResponse = check(response).await?.json().await?;
        Ok(body.messages)
    }

    async fn send_message(
        &self,
        from: &UserId,
        to: &UserId,
        content: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.base_url.join("api/send")?)
            .header(USER_ID_HEADER, from.as_str())
            .json(&SendMessageRequest {
                recipient: to.to_string(),
                message: content.to_string(),
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

async fn check(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|err| err.message)
        .unwrap_or(body);
    Err(TransportError::Rejected {
        status: status.as_u16(),
        message,
    })
}
