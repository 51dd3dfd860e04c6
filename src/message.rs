use serde::{Deserialize, Serialize};

/// A chat message exchanged with a language model: a role plus text content.
///
/// Messages flow through pipeline items (the `messages` field consumed by the
/// `LlmChat` node), are persisted verbatim on each round for replay, and are
/// the payload of the [`LlmClient`](crate::resources::LlmClient) seam.
///
/// # Examples
///
/// ```
/// use loomflow::message::Message;
///
/// let user_msg = Message::user("What happens next?");
/// let system_msg = Message::system("You are the narrator.");
/// assert!(user_msg.has_role(Message::USER));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender (e.g., "user", "assistant", "system").
    pub role: String,
    /// The text content of the message.
    pub content: String,
}

impl Message {
    /// User input message role.
    pub const USER: &'static str = "user";
    /// AI assistant response message role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt or instruction message role.
    pub const SYSTEM: &'static str = "system";

    /// Creates a new message with the specified role and content.
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    /// Creates a user message with the specified content.
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates an assistant message with the specified content.
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates a system message with the specified content.
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Returns true if this message has the specified role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}

/// Rebuild a message list from loosely typed JSON, keeping only the
/// `role`/`content` string fields.
///
/// Round records persist the exact message context that produced a reply;
/// items may carry richer structures, so persistence goes through this
/// narrowing step first.
pub fn sanitize_messages(raw: &serde_json::Value) -> Vec<Message> {
    let Some(entries) = raw.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let obj = entry.as_object()?;
            let role = obj.get("role").and_then(|v| v.as_str()).unwrap_or_default();
            let content = obj
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Some(Message::new(role, content))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::user("hi").role, "user");
        assert_eq!(Message::assistant("yo").role, "assistant");
        assert_eq!(Message::system("sys").role, "system");
    }

    #[test]
    fn sanitize_drops_non_string_fields() {
        let raw = json!([
            {"role": "user", "content": "hello", "tokens": 5},
            {"role": "assistant", "content": "reply"},
            "not a message",
            {"role": 42, "content": "kept with empty role"},
        ]);
        let msgs = sanitize_messages(&raw);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0], Message::user("hello"));
        assert_eq!(msgs[1], Message::assistant("reply"));
        assert_eq!(msgs[2].role, "");
    }

    #[test]
    fn sanitize_non_array_is_empty() {
        assert!(sanitize_messages(&json!({"role": "user"})).is_empty());
    }
}
