//! Session naming hook.
//!
//! On the first user message of a session the bridge asks a namer for a
//! short title, off the message path. The content heuristic below is the
//! always-available non-LLM path; richer namers implement the same trait.

use async_trait::async_trait;

const MAX_NAME_LEN: usize = 48;

#[async_trait]
pub trait SessionNamer: Send + Sync {
    /// Derive a short session title from the first user message.
    /// `None` leaves the session unnamed.
    async fn name_session(&self, first_message: &str) -> Option<String>;
}

/// Content-based fallback: first meaningful line, trimmed to a word
/// boundary.
pub struct HeuristicNamer;

#[async_trait]
impl SessionNamer for HeuristicNamer {
    async fn name_session(&self, first_message: &str) -> Option<String> {
        let name = heuristic_name(first_message);
        if name.is_empty() { None } else { Some(name) }
    }
}

/// First non-empty line with markdown furniture stripped, truncated at a
/// word boundary.
pub fn heuristic_name(content: &str) -> String {
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("```"))
        .unwrap_or("");

    let line = line
        .trim_start_matches(['#', '>', '-', '*', ' '])
        .replace('`', "");
    let line = line.trim();

    if line.chars().count() <= MAX_NAME_LEN {
        return line.to_string();
    }

    let mut name = String::new();
    for word in line.split_whitespace() {
        let candidate_len = name.chars().count() + word.chars().count() + 1;
        if !name.is_empty() && candidate_len > MAX_NAME_LEN {
            break;
        }
        if !name.is_empty() {
            name.push(' ');
        }
        name.push_str(word);
    }
    if name.is_empty() {
        // Single overlong token: hard cut.
        name = line.chars().take(MAX_NAME_LEN).collect();
    }
    name
}
