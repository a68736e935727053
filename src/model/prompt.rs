//! Request bodies for the two Anthropic invocation formats on Bedrock.

use super::ModelRequest;
use crate::history::{ChatMessage, MessageRole};
use serde_json::{json, Value};

const MESSAGES_API_VERSION: &str = "bedrock-2023-05-31";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.5,
            top_p: 1.0,
        }
    }
}

/// `\n\nHuman: ..\n\nAssistant: ..` transcript ending with an open
/// assistant turn.
pub fn text_completion_body(request: &ModelRequest, params: &GenerationParams) -> Value {
    let mut prompt = String::new();
    for message in &request.history {
        let speaker = match message.role {
            MessageRole::Human => "Human",
            MessageRole::Ai => "Assistant",
            MessageRole::System => {
                prompt.push_str(&format!("{}\n", message.content));
                continue;
            }
        };
        prompt.push_str(&format!("\n\n{speaker}: {}", message.content));
    }
    prompt.push_str(&format!("\n\nHuman: {}\n\nAssistant:", request.prompt));

    json!({
        "prompt": prompt,
        "max_tokens_to_sample": params.max_tokens,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "stop_sequences": ["\n\nHuman:"],
    })
}

/// Messages-API body. The API requires alternating turns starting with the
/// user and rejects empty text blocks, so blank turns and leading assistant
/// turns are dropped and runs of one role merged.
pub fn messages_body(request: &ModelRequest, params: &GenerationParams) -> Value {
    let system: Vec<&str> = request
        .history
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect();

    let current = ChatMessage::human(request.prompt.clone());
    let mut turns: Vec<(&'static str, String)> = Vec::new();
    let conversation = request
        .history
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .chain(std::iter::once(&current))
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| {
            let role = if m.role == MessageRole::Ai { "assistant" } else { "user" };
            (role, m.content.clone())
        })
        .skip_while(|(role, _)| *role == "assistant");

    for (role, text) in conversation {
        match turns.last_mut() {
            Some((last, content)) if *last == role => {
                content.push_str("\n\n");
                content.push_str(&text);
            }
            _ => turns.push((role, text)),
        }
    }

    let messages: Vec<Value> = turns
        .into_iter()
        .map(|(role, text)| json!({ "role": role, "content": [{ "type": "text", "text": text }] }))
        .collect();

    let mut body = json!({
        "anthropic_version": MESSAGES_API_VERSION,
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system.join("\n"));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(history: Vec<ChatMessage>, prompt: &str) -> ModelRequest {
        ModelRequest {
            prompt: prompt.to_string(),
            role: "staff-1".to_string(),
            conversation_id: "cid".to_string(),
            history,
        }
    }

    #[test]
    fn text_completion_renders_transcript() {
        let body = text_completion_body(
            &request(
                vec![ChatMessage::human("hi"), ChatMessage::ai("hello!")],
                "how are you",
            ),
            &GenerationParams::default(),
        );
        assert_eq!(
            body["prompt"],
            "\n\nHuman: hi\n\nAssistant: hello!\n\nHuman: how are you\n\nAssistant:"
        );
        assert_eq!(body["max_tokens_to_sample"], 2048);
        assert_eq!(body["stop_sequences"][0], "\n\nHuman:");
    }

    #[test]
    fn messages_body_drops_leading_assistant_and_merges_runs() {
        let body = messages_body(
            &request(
                vec![
                    ChatMessage::system("be brief"),
                    ChatMessage::ai("orphan"),
                    ChatMessage::human("a"),
                    ChatMessage::human("b"),
                    ChatMessage::ai("c"),
                ],
                "d",
            ),
            &GenerationParams::default(),
        );
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"][0]["text"], "a\n\nb");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["content"][0]["text"], "d");
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
    }

    #[test]
    fn messages_body_skips_blank_turns() {
        let body = messages_body(
            &request(
                vec![
                    ChatMessage::human("hello"),
                    ChatMessage::ai(""),
                    ChatMessage::human("again"),
                    ChatMessage::ai("  "),
                ],
                "third",
            ),
            &GenerationParams::default(),
        );
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"][0]["text"], "hello\n\nagain\n\nthird");
        assert!(messages
            .iter()
            .all(|m| !m["content"][0]["text"].as_str().unwrap().is_empty()));
    }

    #[test]
    fn messages_body_without_history_is_one_user_turn() {
        let body = messages_body(&request(vec![], "hello"), &GenerationParams::default());
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(body.get("system").is_none());
    }
}
