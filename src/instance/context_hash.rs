//! Context-state hashing (spec.md §4.2, §9).
//!
//! The hash is an optimization only: collisions never corrupt output because
//! the engine always re-ingests the trailing turn. It must be stable within a
//! single process lifetime, not across versions or processes.

use std::hash::{Hash, Hasher};

use crate::engine::ChatMessage;

/// Canonicalize a chat history into the byte sequence that is hashed:
/// normalized role tag + UTF-8 content + separator, per message, excluding
/// the trailing turn (so that appending just that turn reuses the cache).
pub fn canonical_chat_prefix(messages: &[ChatMessage]) -> String {
    let prefix_len = messages.len().saturating_sub(1);
    canonicalize_chat(&messages[..prefix_len])
}

/// Canonicalize the full conversation, including the trailing turn. Used to
/// record the context state an instance now holds after a completed task,
/// as opposed to [`canonical_chat_prefix`] which is used to look one up.
pub fn canonical_full_chat(messages: &[ChatMessage]) -> String {
    canonicalize_chat(messages)
}

fn canonicalize_chat(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(role_tag(message.role));
        out.push('\0');
        out.push_str(&message.content);
        out.push('\x1e'); // record separator
    }
    out
}

fn role_tag(role: crate::engine::ChatRole) -> &'static str {
    use crate::engine::ChatRole::*;
    match role {
        System => "system",
        User => "user",
        Assistant => "assistant",
        Tool => "tool",
    }
}

/// Canonicalize a text-completion prefix. Trailing whitespace is preserved
/// per spec.md §4.2; there is nothing else to normalize for this task kind.
pub fn canonical_text_prefix(prefix: &str) -> String {
    prefix.to_string()
}

/// Fast, non-cryptographic 128-bit hash of a canonicalized prefix, encoded
/// as 32 lowercase hex characters. Two independently-seeded 64-bit hashers
/// are combined into the two lanes, per spec.md §9's "implausible collision"
/// guidance, without pulling in a new hashing dependency.
pub fn hash_canonical(input: &str) -> String {
    let lane_a = hash_with_seed(input, 0x9E37_79B9_7F4A_7C15);
    let lane_b = hash_with_seed(input, 0xC2B2_AE3D_27D4_EB4F);
    format!("{lane_a:016x}{lane_b:016x}")
}

fn hash_with_seed(input: &str, seed: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    seed.hash(&mut hasher);
    input.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ChatRole;

    fn msg(role: ChatRole, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn prefix_excludes_trailing_turn() {
        let messages = vec![
            msg(ChatRole::User, "Haiku about bears"),
            msg(ChatRole::Assistant, "M1"),
            msg(ChatRole::User, "Six-word title"),
        ];
        let prefix = canonical_chat_prefix(&messages);
        assert!(prefix.contains("Haiku about bears"));
        assert!(prefix.contains("M1"));
        assert!(!prefix.contains("Six-word title"));
    }

    #[test]
    fn same_prefix_hashes_equal() {
        let a = vec![msg(ChatRole::User, "hi"), msg(ChatRole::Assistant, "hello")];
        let b = a.clone();
        assert_eq!(
            hash_canonical(&canonical_chat_prefix(&a)),
            hash_canonical(&canonical_chat_prefix(&b))
        );
    }

    #[test]
    fn different_prefix_hashes_differ() {
        let a = vec![msg(ChatRole::User, "hi"), msg(ChatRole::Assistant, "hello")];
        let b = vec![msg(ChatRole::User, "bye"), msg(ChatRole::Assistant, "hello")];
        assert_ne!(
            hash_canonical(&canonical_chat_prefix(&a)),
            hash_canonical(&canonical_chat_prefix(&b))
        );
    }

    #[test]
    fn hash_is_32_hex_chars() {
        assert_eq!(hash_canonical("anything").len(), 32);
    }
}
