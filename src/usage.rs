//! Usage Counter (§4.3): conversation-turn fingerprinting, the "does this request count"
//! classification, and a scoped commit-on-success handle for the deferred increment.
//!
//! Counting only ever happens after a successful upstream interaction begins (streaming) or
//! completes (unary) — never before — so a pre-check denial, a client retry on a 4xx/5xx, or
//! a `/count_tokens` probe never charges quota (§9, "Deferred usage counting is a two-phase
//! commit over quota").

use serde_json::Value;

/// Caller fingerprint used to dedup usage counting across rapid retries (§4.3). Deliberately
/// excludes message content: some upstreams mutate message bodies between retries, which
/// would otherwise produce spurious distinct fingerprints for the same logical turn (§9).
pub fn conversation_id(client_ip: &str, user_agent: &str) -> String {
    let truncated_ua: String = user_agent.chars().take(50).collect();
    format!("{client_ip}:{truncated_ua}")
}

/// `true` iff the path targets the count-tokens endpoint, which never counts against quota
/// regardless of message shape (§4.3, §4.7).
pub fn is_count_tokens(path: &str) -> bool {
    path.contains("/count_tokens")
}

/// `true` iff the request's last message has role `user` and its content is not a
/// `tool_result` block (§4.3). Strings always count; content arrays count iff no block in
/// them is a `tool_result`; a single content object counts iff its `type` isn't
/// `tool_result`. A request with no messages, or whose last message isn't `role: user`,
/// never counts.
pub fn last_message_is_countable_user_text(body: &Value) -> bool {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return false;
    };
    let Some(last) = messages.last() else {
        return false;
    };
    if last.get("role").and_then(Value::as_str) != Some("user") {
        return false;
    }

    match last.get("content") {
        Some(Value::String(_)) => true,
        Some(Value::Array(blocks)) => !blocks.iter().any(is_tool_result_block),
        Some(content @ Value::Object(_)) => !is_tool_result_block(content),
        _ => false,
    }
}

fn is_tool_result_block(block: &Value) -> bool {
    block.get("type").and_then(Value::as_str) == Some("tool_result")
}

/// Whether this request should count against quota at all, computed once up front by the
/// Entry Handler (§4.7 step 4) and carried through the pipeline to the point of commit.
pub fn should_count_usage(path: &str, body: &Value) -> bool {
    !is_count_tokens(path) && last_message_is_countable_user_text(body)
}

/// Scoped commit-on-success handle for the deferred usage increment (§9). Constructed once
/// the pipeline knows `shouldCountUsage` and has a `conversationId`; `commit` is invoked on
/// the 2xx-upstream happy path, and simply dropping it (the error paths) does nothing —
/// there is no quota mutation to undo because none was ever made.
pub struct UsageCommit {
    token: String,
    conversation_id: Option<String>,
    armed: bool,
}

impl UsageCommit {
    pub fn armed(token: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            token: token.into(),
            conversation_id,
            armed: true,
        }
    }

    pub fn disarmed(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            conversation_id: None,
            armed: false,
        }
    }

    /// Commit the deferred increment. No-op if this handle was never armed (request didn't
    /// qualify for counting in the first place).
    pub async fn commit<S: crate::store::Store>(self, store: &S) -> crate::errors::Result<()> {
        if !self.armed {
            return Ok(());
        }
        store.increment_usage(&self.token, self.conversation_id.as_deref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conversation_id_truncates_user_agent_to_50_chars() {
        let ua = "x".repeat(100);
        let id = conversation_id("1.2.3.4", &ua);
        assert_eq!(id, format!("1.2.3.4:{}", "x".repeat(50)));
    }

    #[test]
    fn count_tokens_path_never_counts() {
        assert!(is_count_tokens("/v1/messages/count_tokens"));
        assert!(!should_count_usage(
            "/v1/messages/count_tokens",
            &json!({"messages": [{"role": "user", "content": "hi"}]})
        ));
    }

    #[test]
    fn string_content_from_user_counts() {
        let body = json!({"messages": [{"role": "user", "content": "hello"}]});
        assert!(last_message_is_countable_user_text(&body));
    }

    #[test]
    fn tool_result_array_block_does_not_count() {
        let body = json!({
            "messages": [{"role": "user", "content": [{"type": "tool_result", "content": "ok"}]}]
        });
        assert!(!last_message_is_countable_user_text(&body));
    }

    #[test]
    fn mixed_array_with_one_tool_result_block_does_not_count() {
        let body = json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "hi"},
                {"type": "tool_result", "content": "ok"}
            ]}]
        });
        assert!(!last_message_is_countable_user_text(&body));
    }

    #[test]
    fn assistant_last_message_does_not_count() {
        let body = json!({"messages": [{"role": "assistant", "content": "hi"}]});
        assert!(!last_message_is_countable_user_text(&body));
    }

    #[test]
    fn single_object_content_counts_unless_tool_result() {
        let counts = json!({"messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}]});
        assert!(last_message_is_countable_user_text(&counts));

        let does_not = json!({"messages": [{"role": "user", "content": {"type": "tool_result", "content": "ok"}}]});
        assert!(!last_message_is_countable_user_text(&does_not));
    }

    #[tokio::test]
    async fn disarmed_commit_does_not_touch_the_store() {
        let store = crate::store::InMemoryStore::default();
        store.insert_key(
            "tok",
            crate::store::KeyRecord {
                expiry: chrono::Utc::now().date_naive() + chrono::Duration::days(1),
                daily_limit: 5,
                usage_today: crate::store::UsageToday { date: chrono::Utc::now().date_naive(), count: 0 },
                selected_model: None,
                selected_api_profile_id: None,
                last_request_timestamp: None,
                last_conversation_id: None,
            },
        );

        UsageCommit::disarmed("tok").commit(&store).await.unwrap();
        let check = store.check_usage("tok").await.unwrap();
        assert_eq!(check.current, 0);
    }
}
