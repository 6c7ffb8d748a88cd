//! Prompt assembly.
//!
//! Builds the opaque prompt object handed to the LLM adapter from the
//! final user text, a scaffold snapshot, and optional relational context.
//! Assembly never awaits the memory subsystem on the hot path: scaffold
//! access is bounded by the cache's lookup timeout and falls back to the
//! empty profile.

use crate::scaffold::{Scaffold, ScaffoldCache, ScaffoldOrigin, ScaffoldValue};

/// The assembled prompt. Opaque to the core; the LLM adapter decides how
/// to render it for its wire format.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub user_text: String,
    pub profile: Scaffold,
    pub profile_origin: Option<ScaffoldOrigin>,
    pub relational_context: Option<String>,
}

impl Prompt {
    /// Flatten the prompt into a single conditioning string. Adapters that
    /// speak plain-text system prompts can use this directly.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.profile.fields.is_empty() || self.profile.intimacy > 0.0 {
            out.push_str("Companion profile:\n");
            out.push_str(&format!("- intimacy: {:.2}\n", self.profile.intimacy));
            for (key, value) in &self.profile.fields {
                match value {
                    ScaffoldValue::Text(t) => out.push_str(&format!("- {key}: {t}\n")),
                    ScaffoldValue::Number(n) => out.push_str(&format!("- {key}: {n:.2}\n")),
                    ScaffoldValue::List(items) => {
                        let joined: Vec<&str> = items.iter().map(String::as_str).collect();
                        out.push_str(&format!("- {key}: {}\n", joined.join(", ")));
                    }
                }
            }
            out.push('\n');
        }
        if let Some(ctx) = &self.relational_context {
            out.push_str(ctx);
            out.push_str("\n\n");
        }
        out.push_str("User message:\n");
        out.push_str(&self.user_text);
        out
    }
}

/// Assembly result. `scaffold_missing` tells the caller to schedule a
/// scaffold warm for the user.
#[derive(Debug)]
pub struct AssembledPrompt {
    pub prompt: Prompt,
    pub scaffold_missing: bool,
}

/// Assemble a prompt for one turn. Uses whatever scaffold the cache can
/// produce within its bounded lookup, stale included; a miss uses the
/// empty profile.
pub async fn assemble(
    cache: &ScaffoldCache,
    user_id: &str,
    user_text: &str,
    relational_context: Option<String>,
) -> AssembledPrompt {
    let snapshot = cache.get_for_session(user_id).await;
    let scaffold_missing = snapshot.is_none();
    let (profile, profile_origin) = match snapshot {
        Some(snap) => (snap.scaffold, Some(snap.origin)),
        None => (Scaffold::empty(), None),
    };
    AssembledPrompt {
        prompt: Prompt {
            user_text: user_text.to_owned(),
            profile,
            profile_origin,
            relational_context,
        },
        scaffold_missing,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ScaffoldConfig;

    #[tokio::test(start_paused = true)]
    async fn cold_cache_yields_empty_profile_and_warm_hint() {
        let cache = ScaffoldCache::new(ScaffoldConfig::default());
        let assembled = assemble(&cache, "u1", "hi there", None).await;
        assert!(assembled.scaffold_missing);
        assert_eq!(assembled.prompt.profile, Scaffold::empty());
        assert!(assembled.prompt.render().ends_with("hi there"));
    }

    #[tokio::test(start_paused = true)]
    async fn cached_scaffold_is_folded_in() {
        let cache = ScaffoldCache::new(ScaffoldConfig::default());
        let mut scaffold = Scaffold::empty();
        scaffold.intimacy = 0.4;
        scaffold.fields.insert(
            "emotional_undercurrent".into(),
            ScaffoldValue::Text("guarded".into()),
        );
        cache.apply_realtime("u1", scaffold).await;

        let assembled = assemble(&cache, "u1", "hello", Some("Recent context:\n- ...".into())).await;
        assert!(!assembled.scaffold_missing);
        assert_eq!(assembled.prompt.profile_origin, Some(ScaffoldOrigin::Realtime));
        let rendered = assembled.prompt.render();
        assert!(rendered.contains("emotional_undercurrent: guarded"));
        assert!(rendered.contains("Recent context:"));
    }
}
