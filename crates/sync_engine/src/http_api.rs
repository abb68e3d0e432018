//! REST client for the `/api/v4` surface, implementing both client traits.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{Category, CategoryId, Channel, ChannelId, FileId, Page, Post, PostId, Reaction, TeamId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        millis_to_datetime, CategoriesResponse, CategoryPayload, ChannelMemberPayload, ChannelPayload,
        CreatePostRequest, PatchPostRequest, PostListResponse, PostPayload, ReactionPayload, ServerErrorBody,
        ViewChannelRequest, WireError,
    },
};
use tracing::debug;
use url::Url;

use crate::{
    posts::PostDraft, transport_failure, unreads::UnreadCounts, ChannelSnapshot, MutationClient,
    PaginationClient,
};

#[derive(Serialize)]
struct PostPageQuery<'a> {
    per_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<&'a str>,
}

pub struct HttpChatApi {
    http: Client,
    base_url: Url,
    auth_token: Option<String>,
    user_id: UserId,
}

impl HttpChatApi {
    pub fn new(server_url: &str, auth_token: Option<String>, user_id: UserId) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(server_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            auth_token,
            user_id,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = self
            .base_url
            .join(&format!("api/v4/{path}"))
            .map_err(|err| ApiError::new(ErrorCode::Validation, format!("invalid request path {path}: {err}")))?;
        let builder = self.http.request(method, url);
        Ok(match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn fetch_post_list(&self, channel_id: &ChannelId, query: PostPageQuery<'_>) -> Result<PostListResponse, ApiError> {
        let builder = self
            .request(Method::GET, &format!("channels/{channel_id}/posts"))?
            .query(&query);
        send_json(builder).await
    }
}

async fn send(builder: RequestBuilder) -> Result<Response, ApiError> {
    let response = builder
        .send()
        .await
        .map_err(|err| transport_failure(format!("request failed: {err}")))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ServerErrorBody>().await.unwrap_or_default();
    let message = if body.message.is_empty() {
        status.to_string()
    } else {
        body.message
    };
    debug!(status = status.as_u16(), %message, "http_api: request rejected");
    Err(ApiError::new(ErrorCode::from_http_status(status.as_u16()), message))
}

async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ApiError> {
    send(builder)
        .await?
        .json::<T>()
        .await
        .map_err(|err| ApiError::new(ErrorCode::Internal, format!("invalid response body: {err}")))
}

async fn send_empty(builder: RequestBuilder) -> Result<(), ApiError> {
    send(builder).await.map(|_| ())
}

fn wire_failure(err: WireError) -> ApiError {
    ApiError::new(ErrorCode::Internal, format!("invalid response payload: {err}"))
}

fn into_post(payload: PostPayload) -> Result<Post, ApiError> {
    Post::try_from(payload).map_err(wire_failure)
}

#[async_trait]
impl PaginationClient for HttpChatApi {
    async fn fetch_older_posts(
        &self,
        channel_id: &ChannelId,
        before: Option<&PostId>,
        per_page: u32,
    ) -> Result<Page, ApiError> {
        let list = self
            .fetch_post_list(
                channel_id,
                PostPageQuery {
                    per_page,
                    before: before.map(PostId::as_str),
                    after: None,
                },
            )
            .await?;
        let has_more = !list.prev_post_id.is_empty();
        list.into_page(has_more).map_err(wire_failure)
    }

    async fn fetch_newer_posts(
        &self,
        channel_id: &ChannelId,
        after: Option<&PostId>,
        per_page: u32,
    ) -> Result<Page, ApiError> {
        let list = self
            .fetch_post_list(
                channel_id,
                PostPageQuery {
                    per_page,
                    before: None,
                    after: after.map(PostId::as_str),
                },
            )
            .await?;
        let has_more = list.has_next || !list.next_post_id.is_empty();
        list.into_page(has_more).map_err(wire_failure)
    }

    async fn fetch_thread(&self, root_id: &PostId) -> Result<Page, ApiError> {
        let list: PostListResponse = send_json(self.request(Method::GET, &format!("posts/{root_id}/thread"))?).await?;
        let has_more = list.has_next;
        list.into_page(has_more).map_err(wire_failure)
    }

    async fn fetch_team_channels(&self, team_id: &TeamId) -> Result<Vec<ChannelSnapshot>, ApiError> {
        let channels: Vec<ChannelPayload> =
            send_json(self.request(Method::GET, &format!("users/me/teams/{team_id}/channels"))?).await?;
        let members: Vec<ChannelMemberPayload> = send_json(
            self.request(Method::GET, &format!("users/me/teams/{team_id}/channels/members"))?,
        )
        .await?;
        let members = members
            .into_iter()
            .map(|member| (member.channel_id.clone(), member))
            .collect::<HashMap<_, _>>();

        let mut snapshots = Vec::with_capacity(channels.len());
        for payload in channels {
            let total = payload.total_msg_count;
            let mut channel = Channel::try_from(payload).map_err(wire_failure)?;
            let mut counts = UnreadCounts::default();
            if let Some(member) = members.get(channel.id.as_str()) {
                channel.muted = member.is_muted();
                channel.last_viewed_at =
                    millis_to_datetime("last_viewed_at", member.last_viewed_at).map_err(wire_failure)?;
                channel.member_ids.insert(self.user_id.clone());
                let unread = total.saturating_sub(member.msg_count);
                counts = UnreadCounts::new(u32::try_from(unread).unwrap_or(u32::MAX), member.mention_count);
            }
            snapshots.push(ChannelSnapshot { channel, counts });
        }
        Ok(snapshots)
    }

    async fn fetch_channel(&self, channel_id: &ChannelId) -> Result<Channel, ApiError> {
        let payload: ChannelPayload = send_json(self.request(Method::GET, &format!("channels/{channel_id}"))?).await?;
        let mut channel = Channel::try_from(payload).map_err(wire_failure)?;
        channel.member_ids.insert(self.user_id.clone());
        Ok(channel)
    }

    async fn fetch_team_categories(&self, team_id: &TeamId) -> Result<Vec<Category>, ApiError> {
        let response: CategoriesResponse = send_json(self.request(
            Method::GET,
            &format!("users/{}/teams/{team_id}/channels/categories", self.user_id),
        )?)
        .await?;
        response.into_categories().map_err(wire_failure)
    }
}

#[async_trait]
impl MutationClient for HttpChatApi {
    async fn create_post(&self, draft: &PostDraft) -> Result<Post, ApiError> {
        let body = CreatePostRequest::new(
            &draft.channel_id,
            draft.root_id.as_ref(),
            &draft.message,
            &draft.file_ids,
            &draft.temp_id,
        );
        let payload: PostPayload = send_json(self.request(Method::POST, "posts")?.json(&body)).await?;
        into_post(payload)
    }

    async fn edit_post(&self, post_id: &PostId, message: &str, file_ids: &[FileId]) -> Result<Post, ApiError> {
        let body = PatchPostRequest {
            message: message.to_string(),
            file_ids: file_ids.iter().map(ToString::to_string).collect(),
        };
        let payload: PostPayload =
            send_json(self.request(Method::PUT, &format!("posts/{post_id}/patch"))?.json(&body)).await?;
        into_post(payload)
    }

    async fn delete_post(&self, post_id: &PostId) -> Result<(), ApiError> {
        send_empty(self.request(Method::DELETE, &format!("posts/{post_id}"))?).await
    }

    async fn add_reaction(&self, reaction: &Reaction) -> Result<(), ApiError> {
        send_empty(self.request(Method::POST, "reactions")?.json(&ReactionPayload::from(reaction))).await
    }

    async fn remove_reaction(&self, reaction: &Reaction) -> Result<(), ApiError> {
        send_empty(self.request(
            Method::DELETE,
            &format!(
                "users/{}/posts/{}/reactions/{}",
                reaction.user_id, reaction.post_id, reaction.emoji_name
            ),
        )?)
        .await
    }

    async fn move_channel_category(&self, team_id: &TeamId, categories: &[Category]) -> Result<(), ApiError> {
        let body = categories
            .iter()
            .map(|category| CategoryPayload::from_category(category, &self.user_id))
            .collect::<Vec<_>>();
        send_empty(
            self.request(
                Method::PUT,
                &format!("users/{}/teams/{team_id}/channels/categories", self.user_id),
            )?
            .json(&body),
        )
        .await
    }

    async fn update_category_order(&self, team_id: &TeamId, order: &[CategoryId]) -> Result<(), ApiError> {
        let body = order.iter().map(ToString::to_string).collect::<Vec<_>>();
        send_empty(
            self.request(
                Method::PUT,
                &format!("users/{}/teams/{team_id}/channels/categories/order", self.user_id),
            )?
            .json(&body),
        )
        .await
    }

    async fn mark_channel_viewed(&self, channel_id: &ChannelId) -> Result<(), ApiError> {
        let body = ViewChannelRequest {
            channel_id: channel_id.to_string(),
            prev_channel_id: String::new(),
        };
        send_empty(
            self.request(Method::POST, &format!("channels/members/{}/view", self.user_id))?
                .json(&body),
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/http_api_tests.rs"]
mod tests;
