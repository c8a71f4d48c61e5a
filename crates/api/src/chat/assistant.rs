//! Studio assistant: retrieval plus LLM, with a knowledge-only fallback

use serde::Serialize;
use studio_shared::{ChatMessage, ChatRole};

use super::knowledge::KnowledgeBase;
use super::llm::{LlmClient, LlmMessage};

/// Entries passed to the model as context
const CONTEXT_ENTRIES: usize = 4;

/// Past messages replayed to the model
const HISTORY_MESSAGES: usize = 10;

/// Where a reply came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Llm,
    Knowledge,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantReply {
    pub content: String,
    pub source: ReplySource,
}

/// Studio identity woven into the prompt and fallback text
#[derive(Debug, Clone)]
pub struct StudioContext<'a> {
    pub studio_name: &'a str,
    pub contact_email: &'a str,
    pub contact_phone: Option<&'a str>,
    /// Hours, rate and similar live facts, one per line
    pub live_facts: &'a str,
}

#[derive(Clone)]
pub struct ChatAssistant {
    llm: LlmClient,
}

impl ChatAssistant {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    pub fn llm_enabled(&self) -> bool {
        self.llm.is_enabled()
    }

    fn system_prompt(studio: &StudioContext<'_>, knowledge: &KnowledgeBase, question: &str) -> String {
        let mut prompt = format!(
            "You are the assistant of {name}, a recording studio. Answer briefly and politely, \
             in the language the visitor writes in. Use only the information below. If the \
             answer is not there, say you are not sure and suggest contacting the studio at {email}.\n\n\
             Studio facts:\n{facts}\n",
            name = studio.studio_name,
            email = studio.contact_email,
            facts = studio.live_facts,
        );

        let entries = knowledge.retrieve(question, CONTEXT_ENTRIES);
        if !entries.is_empty() {
            prompt.push_str("\nRelevant information:\n");
            for entry in entries {
                prompt.push_str(&format!("- {}: {}\n", entry.title, entry.content));
            }
        }
        prompt
    }

    fn build_messages(
        studio: &StudioContext<'_>,
        history: &[ChatMessage],
        question: &str,
        knowledge: &KnowledgeBase,
    ) -> Vec<LlmMessage> {
        let mut messages = vec![LlmMessage::system(Self::system_prompt(
            studio, knowledge, question,
        ))];

        let skip = history.len().saturating_sub(HISTORY_MESSAGES);
        for message in &history[skip..] {
            let content = message.content.clone();
            if message.role == ChatRole::User.as_str() {
                messages.push(LlmMessage::user(content));
            } else {
                // Staff replies read as the studio speaking
                messages.push(LlmMessage::assistant(content));
            }
        }

        messages.push(LlmMessage::user(question));
        messages
    }

    /// Answer without the model: best knowledge match, else point to a human
    pub fn fallback(
        studio: &StudioContext<'_>,
        question: &str,
        knowledge: &KnowledgeBase,
    ) -> AssistantReply {
        if let Some(best) = knowledge.retrieve(question, 1).first() {
            return AssistantReply {
                content: best.content.to_string(),
                source: ReplySource::Knowledge,
            };
        }

        let phone = studio
            .contact_phone
            .map(|p| format!(" or call {}", p))
            .unwrap_or_default();
        AssistantReply {
            content: format!(
                "I'm not sure about that one. Please write to {}{} and the {} team will help you.",
                studio.contact_email, phone, studio.studio_name
            ),
            source: ReplySource::Fallback,
        }
    }

    /// Reply to `question` given the prior conversation
    pub async fn reply(
        &self,
        studio: &StudioContext<'_>,
        history: &[ChatMessage],
        question: &str,
        knowledge: &KnowledgeBase,
    ) -> AssistantReply {
        if !self.llm.is_enabled() {
            return Self::fallback(studio, question, knowledge);
        }

        let messages = Self::build_messages(studio, history, question, knowledge);
        match self.llm.complete(&messages).await {
            Ok(content) => AssistantReply {
                content,
                source: ReplySource::Llm,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Assistant LLM call failed, using knowledge fallback");
                Self::fallback(studio, question, knowledge)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::llm::LlmConfig;
    use std::time::Duration;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn studio() -> StudioContext<'static> {
        StudioContext {
            studio_name: "Casa Som",
            contact_email: "oi@casasom.test",
            contact_phone: Some("+55 11 5555-0000"),
            live_facts: "Open 09:00-22:00, closed on Sundays.",
        }
    }

    fn assistant(url: &str, enabled: bool) -> ChatAssistant {
        ChatAssistant::new(
            LlmClient::new(LlmConfig {
                base_url: url.to_string(),
                api_key: "sk-test".to_string(),
                model: "m".to_string(),
                timeout: Duration::from_secs(5),
                enabled,
            })
            .unwrap(),
        )
    }

    fn message(role: ChatRole, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            role: role.as_str().to_string(),
            content: content.to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_messages_include_context_and_history() {
        let kb = KnowledgeBase::with_faqs(&[]);
        let history = vec![
            message(ChatRole::User, "hello"),
            message(ChatRole::Staff, "Hi! How can we help?"),
        ];
        let messages =
            ChatAssistant::build_messages(&studio(), &history, "cancellation policy?", &kb);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("Casa Som"));
        assert!(messages[0].content.contains("Cancellation policy"));
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3], LlmMessage::user("cancellation policy?"));
    }

    #[test]
    fn test_history_is_truncated() {
        let kb = KnowledgeBase::default();
        let history: Vec<_> = (0..25).map(|i| message(ChatRole::User, &format!("m{}", i))).collect();
        let messages = ChatAssistant::build_messages(&studio(), &history, "q", &kb);
        assert_eq!(messages.len(), 1 + HISTORY_MESSAGES + 1);
        assert_eq!(messages[1].content, "m15");
    }

    #[tokio::test]
    async fn test_disabled_llm_uses_knowledge() {
        let kb = KnowledgeBase::with_faqs(&[]);
        let reply = assistant("http://127.0.0.1:9", false)
            .reply(&studio(), &[], "which services do you offer", &kb)
            .await;
        assert_eq!(reply.source, ReplySource::Knowledge);
        assert!(reply.content.contains("mastering"));
    }

    #[tokio::test]
    async fn test_unknown_question_points_to_contact() {
        let reply = ChatAssistant::fallback(&studio(), "zebra", &KnowledgeBase::default());
        assert_eq!(reply.source, ReplySource::Fallback);
        assert!(reply.content.contains("oi@casasom.test"));
        assert!(reply.content.contains("+55 11 5555-0000"));
    }

    #[tokio::test]
    async fn test_llm_reply_and_failure_fallback() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"We open at 9."}}]}"#)
            .create_async()
            .await;

        let kb = KnowledgeBase::with_faqs(&[]);
        let reply = assistant(&server.url(), true)
            .reply(&studio(), &[], "when do you open", &kb)
            .await;
        assert_eq!(reply.source, ReplySource::Llm);
        assert_eq!(reply.content, "We open at 9.");
        ok.assert_async().await;

        let mut failing = mockito::Server::new_async().await;
        let _bad = failing
            .mock("POST", "/chat/completions")
            .with_status(400)
            .create_async()
            .await;
        let reply = assistant(&failing.url(), true)
            .reply(&studio(), &[], "how to book a session", &kb)
            .await;
        assert_eq!(reply.source, ReplySource::Knowledge);
    }
}
