//! Chat template formatting.
//!
//! The external process is driven by a flat delimiter template rather than a
//! Jinja chat template: each turn is wrapped in a configured prefix/suffix
//! pair and the prompt ends on an open assistant turn.

use serde::{Deserialize, Serialize};

/// Role delimiters understood (and echoed back) by the model executable.
///
/// Loaded once at startup from the `[chat_format]` section and never mutated.
/// Any field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatFormat {
    pub system_prefix: String,
    pub system_suffix: String,
    pub user_prefix: String,
    pub user_suffix: String,
    pub assistant_prefix: String,
    pub assistant_suffix: String,
}

impl ChatFormat {
    /// Build the final prompt for one system/user exchange.
    ///
    /// The result ends with `assistant_prefix` and no suffix so the process
    /// continues generating as the assistant.
    pub fn format(&self, system_prompt: &str, user_prompt: &str) -> String {
        let mut prompt = String::with_capacity(
            self.system_prefix.len()
                + system_prompt.len()
                + self.system_suffix.len()
                + self.user_prefix.len()
                + user_prompt.len()
                + self.user_suffix.len()
                + self.assistant_prefix.len(),
        );
        prompt.push_str(&self.system_prefix);
        prompt.push_str(system_prompt);
        prompt.push_str(&self.system_suffix);
        prompt.push_str(&self.user_prefix);
        prompt.push_str(user_prompt);
        prompt.push_str(&self.user_suffix);
        prompt.push_str(&self.assistant_prefix);
        prompt
    }
}
