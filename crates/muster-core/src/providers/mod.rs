//! Conversational engine backends

pub mod ollama;

pub use ollama::OllamaEngine;
