use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, PrivateMessage};

/// Content category carried by room and private messages.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Video,
    File,
    Audio,
    System,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::File => "file",
            ContentType::Audio => "audio",
            ContentType::System => "system",
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentType::Text),
            "image" => Ok(ContentType::Image),
            "video" => Ok(ContentType::Video),
            "file" => Ok(ContentType::File),
            "audio" => Ok(ContentType::Audio),
            "system" => Ok(ContentType::System),
            other => Err(anyhow::anyhow!("unknown content type: {}", other)),
        }
    }
}

fn default_limit() -> u32 {
    50
}

fn default_private_type() -> ContentType {
    ContentType::Text
}

/// Every request a client may send, keyed by the wire `type` field.
/// Required vs. optional fields are declared here once; the session
/// loop never probes for field presence again.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        password: String,
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
    },
    Logout,
    Text {
        content: String,
        /// When present the message is routed privately instead of broadcast.
        #[serde(default)]
        receiver: Option<String>,
    },
    Image {
        filename: String,
        data: String,
        size: i64,
    },
    Video {
        filename: String,
        data: String,
        size: i64,
    },
    Audio {
        filename: String,
        data: String,
        size: i64,
    },
    File {
        filename: String,
        data: String,
        size: i64,
    },
    Private {
        receiver: String,
        content: String,
        #[serde(default = "default_private_type")]
        content_type: ContentType,
    },
    RefreshUsers,
    GetHistory {
        #[serde(default)]
        message_id: Option<Uuid>,
        #[serde(default = "default_limit")]
        limit: u32,
    },
    GetPrivateHistory {
        conversation_id: Uuid,
        #[serde(default = "default_limit")]
        limit: u32,
    },
    GetConversation {
        username1: String,
        username2: String,
    },
    /// Client opened a private message; flip its read flag.
    MarkRead {
        message_id: Uuid,
    },
}

/// Every envelope the server writes back, both direct responses and
/// unsolicited pushes (system notices, user lists, relayed content).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    LoginSuccess {
        username: String,
        message: String,
    },
    LoginFailed {
        message: String,
    },
    RegisterSuccess {
        message: String,
    },
    RegisterFailed {
        message: String,
    },
    MessageSent {
        message: String,
    },
    PrivateMessageSent {
        conversation_id: Uuid,
        message: String,
    },
    UserList {
        users: Vec<String>,
    },
    System {
        message: String,
        timestamp: i64,
    },
    Text {
        username: String,
        content: String,
        timestamp: i64,
    },
    Image {
        username: String,
        filename: String,
        data: String,
        size: i64,
        timestamp: i64,
    },
    Video {
        username: String,
        filename: String,
        data: String,
        size: i64,
        timestamp: i64,
    },
    Audio {
        username: String,
        filename: String,
        data: String,
        size: i64,
        timestamp: i64,
    },
    File {
        username: String,
        filename: String,
        data: String,
        size: i64,
        timestamp: i64,
    },
    Private {
        username: String,
        receiver: String,
        content: String,
        content_type: ContentType,
        conversation_id: Uuid,
        timestamp: i64,
    },
    GetHistory {
        messages: Vec<Message>,
    },
    PrivateHistory {
        messages: Vec<PrivateMessage>,
    },
    ConversationInfo {
        conversation: Conversation,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tag_round_trip() {
        let req: Request = serde_json::from_str(
            r#"{"type":"login","username":"alice","password":"secret"}"#,
        )
        .unwrap();
        match req {
            Request::Login { username, .. } => assert_eq!(username, "alice"),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn unit_variant_decodes_from_bare_tag() {
        let req: Request = serde_json::from_str(r#"{"type":"logout"}"#).unwrap();
        assert!(matches!(req, Request::Logout));

        let req: Request = serde_json::from_str(r#"{"type":"refresh_users"}"#).unwrap();
        assert!(matches!(req, Request::RefreshUsers));
    }

    #[test]
    fn optional_fields_default() {
        let req: Request =
            serde_json::from_str(r#"{"type":"get_history"}"#).unwrap();
        match req {
            Request::GetHistory { message_id, limit } => {
                assert!(message_id.is_none());
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let req: Request = serde_json::from_str(
            r#"{"type":"private","receiver":"bob","content":"hi"}"#,
        )
        .unwrap();
        match req {
            Request::Private { content_type, .. } => {
                assert_eq!(content_type, ContentType::Text)
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn mark_read_carries_a_message_id() {
        let req: Request = serde_json::from_str(
            r#"{"type":"mark_read","message_id":"4a9d6c2e-58b7-4f30-9c5a-1f2e3d4c5b6a"}"#,
        )
        .unwrap();
        assert!(matches!(req, Request::MarkRead { .. }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<Request>(r#"{"type":"teleport"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn response_tag_names() {
        let resp = Response::LoginFailed {
            message: "user already online".into(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""type":"login_failed""#));
    }
}
