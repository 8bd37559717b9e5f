//! Prompt templates for the translation pipeline.
//!
//! Every prompt is a system block describing the task plus one user block
//! carrying the content, wrapped in tag-like sections so the model can tell
//! the material to translate apart from the reference translations.

use std::collections::BTreeSet;

use crate::ai::ChatMessage;

#[derive(Debug, Clone)]
pub struct PromptSet {
    /// Human-readable target language, e.g. "Simplified Chinese".
    pub target_language: String,
    /// Extra formatting rules appended to every translation task.
    pub rules: Vec<String>,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self::new("Simplified Chinese")
    }
}

impl PromptSet {
    pub fn new(target_language: impl Into<String>) -> Self {
        Self {
            target_language: target_language.into(),
            rules: Vec::new(),
        }
    }

    /// Formatting codes used by Minecraft language files.
    pub fn with_minecraft_rules(mut self) -> Self {
        self.rules.push(
            "Keep format specifiers such as %s, %d and %1$s exactly as written.".to_string(),
        );
        self.rules.push(
            "Keep § colour codes attached to the text they style.".to_string(),
        );
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rules.push(rule.into());
        self
    }

    pub fn keyword_extraction(&self, document: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(
                "You are an expert at entity extraction.\n\
                 List the nouns, proper nouns and ambiguous game terms that appear in the \
                 document below. Output plain text with one term per line and nothing else: \
                 no numbering, no explanations, no markup.",
            ),
            ChatMessage::user(format!("<input_document>\n{document}\n</input_document>")),
        ]
    }

    /// Plain key/value chunk; `question` is the pretty-printed JSON object.
    pub fn translate_map(&self, question: &str, context: &BTreeSet<String>) -> Vec<ChatMessage> {
        let task = format!(
            "You are a translation assistant. Translate the text into {}.\n\
             Consult the reference translations: keep terms that already have an \
             established translation exactly as given, and translate new terms in a \
             consistent style.\n\
             Keep every original key unchanged and output **valid JSON** only, without any \
             explanation.",
            self.target_language
        );
        vec![
            ChatMessage::system(self.with_rules(task)),
            ChatMessage::user(untranslated_block("Content to translate", question, context)),
        ]
    }

    /// Nested string / string-list chunk, e.g. quest books.
    pub fn translate_structured(&self, question: &str, context: &BTreeSet<String>) -> Vec<ChatMessage> {
        let task = format!(
            "You are a translation assistant. Translate the values of the JSON object into {}.\n\
             Consult the reference translations: keep terms that already have an \
             established translation exactly as given, and translate new terms in a \
             consistent style.\n\
             Keep every key unchanged. A value that is a list must stay a list with the same \
             number of elements in the same order; empty strings and markers such as \
             {{@pagebreak}} or {{image:...}} stay untouched.\n\
             Output **valid JSON** only, without any explanation.",
            self.target_language
        );
        vec![
            ChatMessage::system(self.with_rules(task)),
            ChatMessage::user(untranslated_block("Content to translate", question, context)),
        ]
    }

    pub fn translate_document(&self, document: &str, context: &BTreeSet<String>) -> Vec<ChatMessage> {
        let task = format!(
            "You are a translation assistant. Translate the document into {}.\n\
             Consult the reference translations: keep terms that already have an \
             established translation exactly as given, and translate new terms in a \
             consistent style.\n\
             Preserve every special marker of the source (tags, links, placeholders, \
             markdown syntax). Output the translated document directly, **without any \
             explanation or notes**.",
            self.target_language
        );
        vec![
            ChatMessage::system(self.with_rules(task)),
            ChatMessage::user(untranslated_block("Document to translate", document, context)),
        ]
    }

    fn with_rules(&self, task: String) -> String {
        if self.rules.is_empty() {
            return task;
        }
        let mut lines = vec![task, String::new(), "Formatting rules:".to_string()];
        lines.extend(self.rules.iter().map(|rule| format!("- {rule}")));
        lines.join("\n")
    }
}

fn untranslated_block(label: &str, content: &str, context: &BTreeSet<String>) -> String {
    let references = context.iter().map(String::as_str).collect::<Vec<_>>().join("\n\n");
    format!(
        "<untranslated>\n{label}:\n{content}\n</untranslated>\n<reference>\nReference translations:\n{references}\n</reference>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::Role;

    fn context(entries: &[&str]) -> BTreeSet<String> {
        entries.iter().map(|entry| entry.to_string()).collect()
    }

    #[test]
    fn map_prompt_embeds_question_and_references() {
        let prompts = PromptSet::default();
        let messages = prompts.translate_map(
            "{\n  \"item.mod.pearl\": \"A magical Ender Pearl.\"\n}",
            &context(&["Ender Pearl=末影珍珠", "Iron Ingot=铁锭"]),
        );

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("Simplified Chinese"));
        let user = &messages[1].content;
        assert!(user.contains("\"item.mod.pearl\": \"A magical Ender Pearl.\""));
        assert!(user.contains("Ender Pearl=末影珍珠\n\nIron Ingot=铁锭"));
    }

    #[test]
    fn rules_are_appended_to_the_task() {
        let prompts = PromptSet::new("Japanese").with_minecraft_rules().with_rule("Be brief.");
        let messages = prompts.translate_document("# Title", &BTreeSet::new());

        let system = &messages[0].content;
        assert!(system.contains("Japanese"));
        assert!(system.contains("Formatting rules:"));
        assert!(system.contains("- Keep format specifiers"));
        assert!(system.ends_with("- Be brief."));
    }

    #[test]
    fn extraction_prompt_wraps_document() {
        let messages = PromptSet::default().keyword_extraction("Craft a Charger.");
        assert!(messages[1]
            .content
            .contains("<input_document>\nCraft a Charger.\n</input_document>"));
    }

    #[test]
    fn structured_prompt_mentions_list_shape() {
        let messages = PromptSet::default().translate_structured("{}", &BTreeSet::new());
        assert!(messages[0].content.contains("{@pagebreak}"));
    }
}
