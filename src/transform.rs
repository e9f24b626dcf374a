//! Request Transformer (§4.5): upstream URL construction, model-name validation/swap, and
//! system-prompt injection across the six supported formats.

use serde_json::{Value, json};

use crate::errors::{Error, Result};
use crate::selector::ActiveSource;
use crate::store::{GlobalSettings, Store, SystemPromptFormat};

/// Builds the upstream URL from a base (`apiBase`) and the client's original path+query
/// (§4.5, P6). Strips a trailing `/` from the base; if the base ends in `/v1` and the client
/// path begins with `/v1`, the duplicate prefix on the client side is stripped before
/// concatenation so the result doesn't double up `/v1/v1/...`.
pub fn build_upstream_url(api_base: &str, path_and_query: &str) -> String {
    let base = api_base.trim_end_matches('/');
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };

    let path = if base.ends_with("/v1") && path.starts_with("/v1") {
        &path["/v1".len()..]
    } else {
        path
    };

    match query {
        Some(q) => format!("{base}{path}?{q}"),
        None => format!("{base}{path}"),
    }
}

/// Validates the caller's `model` field against `settings.model_display` and swaps it for
/// the resolved actual model, stripping `metadata` along the way (§4.5). Mutates `body` in
/// place; returns an error (without mutating) if the model doesn't match.
pub fn validate_and_swap_model(body: &mut Value, settings: &GlobalSettings, active_model_actual: Option<&str>) -> Result<()> {
    let got = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidModel { expected: settings.model_display.clone(), got: String::new() })?
        .to_string();

    if got != settings.model_display {
        return Err(Error::InvalidModel { expected: settings.model_display.clone(), got });
    }

    let resolved = active_model_actual.unwrap_or(&settings.model_actual);
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), json!(resolved));
        obj.remove("metadata");
    }

    Ok(())
}

/// Resolves the system prompt text `P` to inject: the caller's selected model-config prompt
/// if non-empty, else `settings.system_prompt`. Trimmed and truncated to `char_cap`
/// characters (§4.5, §3). Returns `None` if there's nothing to inject.
pub fn resolve_system_prompt(
    selected_model: Option<&str>,
    model_configs: &std::collections::HashMap<String, crate::store::ModelConfig>,
    settings: &GlobalSettings,
    char_cap: usize,
) -> Option<String> {
    let candidate = selected_model
        .and_then(|id| model_configs.get(id))
        .map(|cfg| cfg.system_prompt.as_str())
        .filter(|p| !p.trim().is_empty())
        .or(settings.system_prompt.as_deref());

    let trimmed = candidate?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(char_cap).collect())
}

/// Applies system-prompt injection (§4.5) to `body` in place, given the resolved prompt `P`
/// and request `path` (used by `auto` resolution). No-op if the active source disables
/// injection, or if there's no prompt to inject.
pub fn inject_system_prompt<S: Store>(body: &mut Value, prompt: Option<&str>, path: &str, active: &ActiveSource<S>) {
    let Some(prompt) = prompt else { return };
    if active.disable_system_prompt_injection {
        return;
    }

    let format = resolve_format(active.system_prompt_format, body, path);
    apply_format(body, prompt, format);
}

fn resolve_format(configured: SystemPromptFormat, body: &Value, path: &str) -> SystemPromptFormat {
    match configured {
        SystemPromptFormat::Auto => {
            if body.get("system").is_some() || path.contains("/messages") {
                SystemPromptFormat::Anthropic
            } else {
                SystemPromptFormat::Openai
            }
        }
        other => other,
    }
}

fn apply_format(body: &mut Value, prompt: &str, format: SystemPromptFormat) {
    match format {
        SystemPromptFormat::Auto => unreachable!("resolve_format never returns Auto"),
        SystemPromptFormat::Anthropic => apply_anthropic(body, prompt),
        SystemPromptFormat::Openai => apply_openai(body, prompt),
        SystemPromptFormat::Both => {
            apply_anthropic(body, prompt);
            apply_openai(body, prompt);
        }
        SystemPromptFormat::UserMessage => apply_wrapped_message(body, prompt, false),
        SystemPromptFormat::InjectFirstUser => apply_wrapped_message(body, prompt, true),
        SystemPromptFormat::Disabled => {}
    }
}

fn apply_anthropic(body: &mut Value, prompt: &str) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("system".to_string(), json!(prompt));
    }
}

fn apply_openai(body: &mut Value, prompt: &str) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    if let Some(existing) = messages.iter_mut().find(|m| m.get("role").and_then(Value::as_str) == Some("system")) {
        if let Some(obj) = existing.as_object_mut() {
            obj.insert("content".to_string(), json!(prompt));
        }
    } else {
        messages.insert(0, json!({"role": "system", "content": prompt}));
    }
}

fn wrap(prompt: &str) -> String {
    format!("[System Instructions]\n{prompt}\n[End System Instructions]")
}

fn strip_system(body: &mut Value) {
    if let Some(obj) = body.as_object_mut() {
        obj.remove("system");
    }
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        messages.retain(|m| m.get("role").and_then(Value::as_str) != Some("system"));
    }
}

/// `user_message` prepends a new synthetic user message; `inject_first_user` instead prepends
/// the wrapped text onto the existing first user message's content (§4.5).
fn apply_wrapped_message(body: &mut Value, prompt: &str, inject_into_first_user: bool) {
    strip_system(body);
    let wrapped = wrap(prompt);

    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };

    if !inject_into_first_user {
        messages.insert(0, json!({"role": "user", "content": wrapped}));
        return;
    }

    let Some(first_user) = messages.iter_mut().find(|m| m.get("role").and_then(Value::as_str) == Some("user")) else {
        return;
    };

    match first_user.get_mut("content") {
        Some(Value::Array(blocks)) => {
            blocks.insert(0, json!({"type": "text", "text": wrapped}));
        }
        Some(content @ Value::String(_)) => {
            let existing = content.as_str().unwrap_or_default();
            *content = json!(format!("{wrapped}\n{existing}"));
        }
        _ => {
            if let Some(obj) = first_user.as_object_mut() {
                obj.insert("content".to_string(), json!(wrapped));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_url_stripping_trailing_slash_and_duplicate_v1() {
        assert_eq!(build_upstream_url("https://h/v1/", "/v1/x?a=1"), "https://h/v1/x?a=1");
        assert_eq!(build_upstream_url("https://h", "/v1/x"), "https://h/v1/x");
        assert_eq!(build_upstream_url("https://h/v1", "/v1/x"), "https://h/v1/x");
    }

    #[test]
    fn builds_url_without_query_string() {
        assert_eq!(build_upstream_url("https://h/v1", "/v1/messages"), "https://h/messages");
    }

    #[test]
    fn model_mismatch_is_rejected_without_mutation() {
        let mut body = json!({"model": "wrong"});
        let settings = GlobalSettings {
            api_url: "https://h".to_string(),
            api_key: "k".to_string(),
            model_display: "Display".to_string(),
            model_actual: "m-actual".to_string(),
            system_prompt: None,
            concurrency_limit: None,
            system_prompt_format: None,
            models: Default::default(),
        };
        let err = validate_and_swap_model(&mut body, &settings, None).unwrap_err();
        assert!(matches!(err, Error::InvalidModel { .. }));
        assert_eq!(body["model"], json!("wrong"));
    }

    #[test]
    fn matching_model_is_swapped_and_metadata_stripped() {
        let mut body = json!({"model": "Display", "metadata": {"user": "x"}});
        let settings = GlobalSettings {
            api_url: "https://h".to_string(),
            api_key: "k".to_string(),
            model_display: "Display".to_string(),
            model_actual: "m-default".to_string(),
            system_prompt: None,
            concurrency_limit: None,
            system_prompt_format: None,
            models: Default::default(),
        };
        validate_and_swap_model(&mut body, &settings, Some("m-profile")).unwrap();
        assert_eq!(body["model"], json!("m-profile"));
        assert!(body.get("metadata").is_none());
    }

    #[test]
    fn anthropic_format_sets_top_level_system() {
        let mut body = json!({"messages": []});
        apply_format(&mut body, "be nice", SystemPromptFormat::Anthropic);
        assert_eq!(body["system"], json!("be nice"));
    }

    #[test]
    fn openai_format_prepends_system_message_when_absent() {
        let mut body = json!({"messages": [{"role": "user", "content": "hi"}]});
        apply_format(&mut body, "be nice", SystemPromptFormat::Openai);
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][0]["content"], json!("be nice"));
    }

    #[test]
    fn openai_format_replaces_existing_system_message() {
        let mut body = json!({"messages": [{"role": "system", "content": "old"}, {"role": "user", "content": "hi"}]});
        apply_format(&mut body, "new", SystemPromptFormat::Openai);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][0]["content"], json!("new"));
    }

    #[test]
    fn user_message_format_wraps_and_prepends() {
        let mut body = json!({"system": "old", "messages": [{"role": "system", "content": "x"}, {"role": "user", "content": "hi"}]});
        apply_format(&mut body, "be nice", SystemPromptFormat::UserMessage);
        assert!(body.get("system").is_none());
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        let wrapped = body["messages"][0]["content"].as_str().unwrap();
        assert!(wrapped.contains("[System Instructions]"));
        assert!(wrapped.contains("be nice"));
    }

    #[test]
    fn inject_first_user_prepends_text_block_to_array_content() {
        let mut body = json!({"messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]});
        apply_format(&mut body, "be nice", SystemPromptFormat::InjectFirstUser);
        let blocks = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["type"], json!("text"));
        assert!(blocks[0]["text"].as_str().unwrap().contains("be nice"));
    }

    #[test]
    fn inject_first_user_prepends_to_string_content() {
        let mut body = json!({"messages": [{"role": "assistant", "content": "ignored"}, {"role": "user", "content": "hi"}]});
        apply_format(&mut body, "be nice", SystemPromptFormat::InjectFirstUser);
        let content = body["messages"][1]["content"].as_str().unwrap();
        assert!(content.starts_with("[System Instructions]"));
        assert!(content.ends_with("hi"));
    }

    #[test]
    fn disabled_format_is_a_no_op() {
        let mut body = json!({"messages": []});
        let before = body.clone();
        apply_format(&mut body, "be nice", SystemPromptFormat::Disabled);
        assert_eq!(body, before);
    }

    #[test]
    fn auto_resolves_to_anthropic_for_messages_path() {
        let body = json!({});
        assert_eq!(resolve_format(SystemPromptFormat::Auto, &body, "/v1/messages"), SystemPromptFormat::Anthropic);
    }

    #[test]
    fn auto_resolves_to_openai_for_chat_completions_path() {
        let body = json!({});
        assert_eq!(
            resolve_format(SystemPromptFormat::Auto, &body, "/v1/chat/completions"),
            SystemPromptFormat::Openai
        );
    }
}
