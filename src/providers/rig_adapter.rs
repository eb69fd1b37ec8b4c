//! Bridges rig-core's `CompletionModel` to the `AiProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{CompletionModel, Prompt};
use rig::message::Message;

use crate::error::AiError;
use crate::providers::{AiProvider, AiRequest, Role, TranscriptMessage, classify_ai_error};

/// Prompt used when the transcript does not end with a customer message.
const CONTINUE_PROMPT: &str = "Continue the conversation with a short reply to the customer.";

/// Hosted completion model wrapped as an `AiProvider`.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    provider: String,
    model_name: String,
    max_tokens: u64,
    temperature: f64,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(
        model: M,
        provider: &str,
        model_name: &str,
        max_tokens: u64,
        temperature: f64,
    ) -> Self {
        Self {
            model,
            provider: provider.to_string(),
            model_name: model_name.to_string(),
            max_tokens,
            temperature,
        }
    }
}

/// Split a transcript into rig history plus the prompt to answer.
fn split_transcript(transcript: &[TranscriptMessage]) -> (Vec<Message>, String) {
    let (history, prompt) = match transcript.split_last() {
        Some((last, rest)) if last.role == Role::User => (rest, last.content.clone()),
        _ => (transcript, CONTINUE_PROMPT.to_string()),
    };
    let history = history
        .iter()
        .map(|m| match m.role {
            Role::User => Message::user(m.content.clone()),
            Role::Assistant => Message::assistant(m.content.clone()),
        })
        .collect();
    (history, prompt)
}

#[async_trait]
impl<M> AiProvider for RigAdapter<M>
where
    M: CompletionModel + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn generate_reply(&self, request: &AiRequest) -> Result<String, AiError> {
        let mut builder = AgentBuilder::new(self.model.clone())
            .max_tokens(self.max_tokens)
            .temperature(self.temperature);
        if let Some(system) = request.system.as_deref() {
            builder = builder.preamble(system);
        }
        let agent = builder.build();

        let (mut history, prompt) = split_transcript(&request.transcript);
        agent
            .prompt(prompt.as_str())
            .with_history(&mut history)
            .await
            .map_err(|e| classify_ai_error(&self.provider, &e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_message_becomes_prompt() {
        let transcript = vec![
            TranscriptMessage::user("hi"),
            TranscriptMessage::assistant("hello, how can I help?"),
            TranscriptMessage::user("price list?"),
        ];
        let (history, prompt) = split_transcript(&transcript);
        assert_eq!(prompt, "price list?");
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn trailing_assistant_message_stays_in_history() {
        let transcript = vec![
            TranscriptMessage::user("hi"),
            TranscriptMessage::assistant("hello"),
        ];
        let (history, prompt) = split_transcript(&transcript);
        assert_eq!(prompt, CONTINUE_PROMPT);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn empty_transcript() {
        let (history, prompt) = split_transcript(&[]);
        assert!(history.is_empty());
        assert_eq!(prompt, CONTINUE_PROMPT);
    }
}
