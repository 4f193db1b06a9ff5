//! Request/response collaborator for the HuddleSpace REST backend.
//!
//! Everything request/response-shaped goes through the [`ChatApi`] trait so
//! the engine can be exercised against an in-memory implementation in tests.
//! [`HttpChatApi`] is the production implementation: blocking `ureq` calls
//! carrying a bearer credential, invoked by the engine through
//! `spawn_blocking`.

use serde::Deserialize;
use serde_json::json;

use crate::types::{Message, WireMessage};

/// A failed REST call.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// The server answered with an error status; `message` is the
    /// human-readable message field from its JSON body when present.
    Status { code: u16, message: String },
    /// The request never completed (DNS, refused connection, timeout).
    Network(String),
    /// The response body did not match the expected shape.
    Decode(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Status { code, message } => write!(f, "server error {code}: {message}"),
            ApiError::Network(error) => write!(f, "network error: {error}"),
            ApiError::Decode(error) => write!(f, "decode error: {error}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// One entry of the all-groups listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub group_id: String,
    pub group_name: String,
    pub created_by: String,
}

/// Full group record, including the membership roll.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDetail {
    pub group_id: String,
    pub group_name: String,
    pub created_by: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// Response envelopes used by the backend.
#[derive(Deserialize)]
struct ConversationsBody {
    #[serde(default)]
    conversations: Vec<String>,
}

#[derive(Deserialize)]
struct GroupsBody {
    #[serde(default)]
    groups: Vec<GroupSummary>,
}

#[derive(Deserialize)]
struct GroupBody {
    group: GroupDetail,
}

#[derive(Deserialize)]
struct MessagesBody {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// The REST surface the engine depends on.
///
/// All methods are blocking; the engine runs them inside `spawn_blocking`.
pub trait ChatApi: Send + Sync {
    /// Usernames the local user has an open one-to-one conversation with.
    fn conversations(&self) -> Result<Vec<String>, ApiError>;
    /// Every active group, whether or not the local user is a member.
    fn all_groups(&self) -> Result<Vec<GroupSummary>, ApiError>;
    fn group_detail(&self, group_id: &str) -> Result<GroupDetail, ApiError>;
    fn group_messages(&self, group_id: &str) -> Result<Vec<Message>, ApiError>;
    fn private_messages(&self, peer: &str) -> Result<Vec<Message>, ApiError>;
    fn join_group(&self, group_id: &str) -> Result<(), ApiError>;
    fn leave_group(&self, group_id: &str) -> Result<(), ApiError>;
    /// Add a member; returns the refreshed group record.
    fn add_member(&self, group_id: &str, user: &str) -> Result<GroupDetail, ApiError>;
    fn remove_member(&self, group_id: &str, user: &str) -> Result<(), ApiError>;
    fn create_group(&self, name: &str, description: Option<&str>) -> Result<(), ApiError>;
    fn delete_group(&self, group_id: &str) -> Result<(), ApiError>;
    /// Mark all messages from `peer` as read. Best-effort from the caller's
    /// point of view.
    fn mark_read(&self, peer: &str) -> Result<(), ApiError>;
}

/// Blocking HTTP implementation of [`ChatApi`].
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let url = format!("{}{}", self.base_url, path);
        ureq::request(method, &url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Content-Type", "application/json")
    }

    fn call(&self, method: &str, path: &str, body: Option<serde_json::Value>) -> Result<ureq::Response, ApiError> {
        let request = self.request(method, path);
        let result = match body {
            Some(value) => request.send_json(value),
            None => request.call(),
        };
        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(code, response)) => {
                let message = response
                    .into_json::<ErrorBody>()
                    .ok()
                    .and_then(|body| body.message)
                    .unwrap_or_else(|| "request failed".to_string());
                Err(ApiError::Status { code, message })
            }
            Err(error) => Err(ApiError::Network(error.to_string())),
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call("GET", path, None)?
            .into_json()
            .map_err(|error| ApiError::Decode(error.to_string()))
    }
}

impl ChatApi for HttpChatApi {
    fn conversations(&self) -> Result<Vec<String>, ApiError> {
        let body: ConversationsBody = self.get_json("/api/chat/conversations")?;
        Ok(body.conversations)
    }

    fn all_groups(&self) -> Result<Vec<GroupSummary>, ApiError> {
        let body: GroupsBody = self.get_json("/api/chat/groups/all")?;
        Ok(body.groups)
    }

    fn group_detail(&self, group_id: &str) -> Result<GroupDetail, ApiError> {
        let body: GroupBody = self.get_json(&format!("/api/chat/groups/{group_id}"))?;
        Ok(body.group)
    }

    fn group_messages(&self, group_id: &str) -> Result<Vec<Message>, ApiError> {
        let body: MessagesBody = self.get_json(&format!("/api/chat/groups/{group_id}/messages"))?;
        Ok(body.messages.into_iter().map(WireMessage::into_confirmed).collect())
    }

    fn private_messages(&self, peer: &str) -> Result<Vec<Message>, ApiError> {
        let body: MessagesBody = self.get_json(&format!("/api/chat/private-messages/{peer}"))?;
        Ok(body.messages.into_iter().map(WireMessage::into_confirmed).collect())
    }

    fn join_group(&self, group_id: &str) -> Result<(), ApiError> {
        self.call("POST", &format!("/api/chat/groups/{group_id}/join"), None)?;
        Ok(())
    }

    fn leave_group(&self, group_id: &str) -> Result<(), ApiError> {
        self.call("POST", &format!("/api/chat/groups/{group_id}/leave"), None)?;
        Ok(())
    }

    fn add_member(&self, group_id: &str, user: &str) -> Result<GroupDetail, ApiError> {
        let response = self.call(
            "POST",
            &format!("/api/chat/groups/{group_id}/members/{user}"),
            None,
        )?;
        let body: GroupBody = response
            .into_json()
            .map_err(|error| ApiError::Decode(error.to_string()))?;
        Ok(body.group)
    }

    fn remove_member(&self, group_id: &str, user: &str) -> Result<(), ApiError> {
        self.call(
            "DELETE",
            &format!("/api/chat/groups/{group_id}/members/{user}"),
            None,
        )?;
        Ok(())
    }

    fn create_group(&self, name: &str, description: Option<&str>) -> Result<(), ApiError> {
        self.call(
            "POST",
            "/api/chat/groups",
            Some(json!({ "groupName": name, "description": description })),
        )?;
        Ok(())
    }

    fn delete_group(&self, group_id: &str) -> Result<(), ApiError> {
        self.call("DELETE", &format!("/api/chat/groups/{group_id}"), None)?;
        Ok(())
    }

    fn mark_read(&self, peer: &str) -> Result<(), ApiError> {
        self.call("PUT", &format!("/api/chat/mark-read/{peer}"), None)?;
        Ok(())
    }
}
