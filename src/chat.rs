//! Chat template generation
//!
//! Renders a chat history into the prompt string each model family expects.
//! The selector mirrors the CLI surface: `llama2`, `llama3`, `deepSeek3`.

use crate::error::{RepartirError, Result};

/// Chat template selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplateType {
    /// LLaMA 2 `[INST]` blocks with `<<SYS>>` system sections
    Llama2,
    /// LLaMA 3 header-id message framing
    Llama3,
    /// DeepSeek 3 role-marker framing
    DeepSeek3,
}

impl ChatTemplateType {
    /// Parse the CLI value
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "llama2" => Ok(ChatTemplateType::Llama2),
            "llama3" => Ok(ChatTemplateType::Llama3),
            "deepSeek3" => Ok(ChatTemplateType::DeepSeek3),
            _ => Err(RepartirError::Config(format!(
                "Invalid chat template type: {value}"
            ))),
        }
    }
}

/// One message of a chat history
#[derive(Debug, Clone)]
pub struct ChatItem {
    /// `system`, `user`, or `assistant`
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatItem {
    /// Convenience constructor
    pub fn new(role: &str, content: &str) -> Self {
        ChatItem { role: role.to_string(), content: content.to_string() }
    }
}

/// Renders chat histories for one template family
pub struct ChatTemplateGenerator {
    template: ChatTemplateType,
}

impl ChatTemplateGenerator {
    /// Create a generator for the chosen family
    pub fn new(template: ChatTemplateType) -> Self {
        ChatTemplateGenerator { template }
    }

    /// Render `items`; when `open_assistant` is set, the output ends with
    /// the framing that cues the model to answer.
    pub fn generate(&self, items: &[ChatItem], open_assistant: bool) -> String {
        match self.template {
            ChatTemplateType::Llama2 => self.generate_llama2(items),
            ChatTemplateType::Llama3 => self.generate_llama3(items, open_assistant),
            ChatTemplateType::DeepSeek3 => self.generate_deepseek3(items, open_assistant),
        }
    }

    fn generate_llama2(&self, items: &[ChatItem]) -> String {
        let mut out = String::new();
        let mut system: Option<&str> = None;
        for item in items {
            match item.role.as_str() {
                "system" => system = Some(&item.content),
                "user" => {
                    out.push_str("[INST] ");
                    if let Some(sys) = system.take() {
                        out.push_str("<<SYS>>\n");
                        out.push_str(sys);
                        out.push_str("\n<</SYS>>\n\n");
                    }
                    out.push_str(&item.content);
                    out.push_str(" [/INST]");
                }
                _ => {
                    out.push(' ');
                    out.push_str(&item.content);
                    out.push(' ');
                }
            }
        }
        out
    }

    fn generate_llama3(&self, items: &[ChatItem], open_assistant: bool) -> String {
        let mut out = String::new();
        for item in items {
            out.push_str("<|start_header_id|>");
            out.push_str(&item.role);
            out.push_str("<|end_header_id|>\n\n");
            out.push_str(&item.content);
            out.push_str("<|eot_id|>");
        }
        if open_assistant {
            out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
        }
        out
    }

    fn generate_deepseek3(&self, items: &[ChatItem], open_assistant: bool) -> String {
        let mut out = String::new();
        for item in items {
            match item.role.as_str() {
                "system" => out.push_str(&item.content),
                "user" => {
                    out.push_str("<｜User｜>");
                    out.push_str(&item.content);
                }
                _ => {
                    out.push_str("<｜Assistant｜>");
                    out.push_str(&item.content);
                    out.push_str("<｜end▁of▁sentence｜>");
                }
            }
        }
        if open_assistant {
            out.push_str("<｜Assistant｜>");
        }
        out
    }
}
