//! # Personas
//!
//! A persona ("character" on the wire) bundles the system prompt handed to
//! the chat model with the voice used for synthesis. Sessions hold an
//! `Arc<Persona>` snapshot, so switching persona mid-session never touches
//! the transcription engine.
//!
//! Lookups for unknown ids fall back to the configured default persona.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    /// System prompt for the chat model.
    pub personality: String,
    pub voice: String,
    pub category: String,
    pub popularity: u32,
}

impl Persona {
    fn new(id: &str, name: &str, personality: &str, voice: &str, category: &str, popularity: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            personality: personality.to_string(),
            voice: voice.to_string(),
            category: category.to_string(),
            popularity,
        }
    }

    /// Used only when the configured default id is missing from the store.
    fn assistant() -> Self {
        Self::new(
            "default",
            "Assistant",
            "You are a friendly voice assistant. Answer briefly and conversationally.",
            "neutral",
            "general",
            0,
        )
    }
}

fn builtin_personas() -> Vec<Persona> {
    vec![
        Persona::new(
            "default",
            "Assistant",
            "You are a friendly, helpful voice assistant. Keep answers short and natural, \
             as they will be spoken aloud.",
            "neutral",
            "general",
            100,
        ),
        Persona::new(
            "harry-potter",
            "Harry Potter",
            "You are Harry Potter, a brave young wizard from Hogwarts. You speak warmly, \
             mention friends like Ron and Hermione, and share stories of magic and adventure.",
            "young-male",
            "fiction",
            95,
        ),
        Persona::new(
            "socrates",
            "Socrates",
            "You are Socrates, the philosopher of Athens. Answer questions with questions, \
             guide the listener to examine their own beliefs, and stay humble about what you know.",
            "elder-male",
            "history",
            88,
        ),
        Persona::new(
            "shakespeare",
            "William Shakespeare",
            "You are William Shakespeare. Speak with poetic flair and occasional Early Modern \
             English, and draw on your plays and sonnets when you answer.",
            "mature-male",
            "literature",
            85,
        ),
        Persona::new(
            "einstein",
            "Albert Einstein",
            "You are Albert Einstein. Explain science with curiosity and simple analogies, \
             enjoy thought experiments, and keep a gentle sense of humour.",
            "elder-male",
            "science",
            90,
        ),
        Persona::new(
            "confucius",
            "Confucius",
            "You are Confucius. Answer with calm wisdom about virtue, learning and relationships, \
             often in short proverb-like sentences.",
            "elder-male",
            "philosophy",
            80,
        ),
        Persona::new(
            "anime-girl",
            "Sakura",
            "You are Sakura, a cheerful and energetic anime heroine. You are upbeat, expressive \
             and always encourage the listener.",
            "young-female",
            "entertainment",
            92,
        ),
        Persona::new(
            "professional",
            "Business Consultant",
            "You are a seasoned business consultant. Give structured, practical advice and \
             ask clarifying questions when the goal is unclear.",
            "mature-female",
            "business",
            75,
        ),
        Persona::new(
            "gentle-lady",
            "Gentle Companion",
            "You are a gentle, patient companion. Listen carefully, respond with empathy and \
             speak in a soft, reassuring way.",
            "soft-female",
            "companion",
            87,
        ),
        Persona::new(
            "energetic-boy",
            "Sunny",
            "You are Sunny, an enthusiastic young adventurer who loves sports and games. \
             You are playful, optimistic and full of energy.",
            "young-male",
            "entertainment",
            78,
        ),
    ]
}

/// Registry of available personas.
pub struct PersonaStore {
    profiles: RwLock<HashMap<String, Arc<Persona>>>,
    default_id: String,
}

impl PersonaStore {
    pub fn new(default_id: impl Into<String>) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            default_id: default_id.into(),
        }
    }

    /// Store preloaded with the built-in roster.
    pub fn with_builtin(default_id: impl Into<String>) -> Self {
        let store = Self::new(default_id);
        for persona in builtin_personas() {
            store.upsert(persona);
        }
        info!(count = store.len(), default = %store.default_id, "Loaded persona roster");
        store
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn get(&self, id: &str) -> Option<Arc<Persona>> {
        self.profiles.read().get(id).cloned()
    }

    /// Look up `id`, falling back to the default persona when it is unknown.
    pub fn resolve(&self, id: &str) -> Arc<Persona> {
        if let Some(persona) = self.get(id) {
            return persona;
        }
        debug!(requested = %id, fallback = %self.default_id, "Unknown persona, using default");
        self.get(&self.default_id)
            .unwrap_or_else(|| Arc::new(Persona::assistant()))
    }

    pub fn upsert(&self, persona: Persona) {
        self.profiles
            .write()
            .insert(persona.id.clone(), Arc::new(persona));
    }

    /// All personas, most popular first.
    pub fn list(&self) -> Vec<Arc<Persona>> {
        let mut personas: Vec<_> = self.profiles.read().values().cloned().collect();
        personas.sort_by(|a, b| b.popularity.cmp(&a.popularity).then_with(|| a.id.cmp(&b.id)));
        personas
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }
}
