//! Inference engine seam.
//!
//! The engine is a black box to this pipeline: text prompt in, text out,
//! synchronous, bounded by a token budget and stop sequences. Engine
//! internals (model loading, context sizing) live behind implementations
//! of `InferenceEngine`.

use anyhow::{anyhow, Result};

/// Budget applied to every inference call.
#[derive(Clone, Debug)]
pub struct InferenceOptions {
    pub max_tokens: usize,
    pub stop_sequences: Vec<String>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            max_tokens: 64,
            stop_sequences: vec!["Q:".to_string(), "\n".to_string()],
        }
    }
}

/// Black-box inference function. Blocks the calling thread for the
/// duration of the call; may fail on internal engine errors.
pub trait InferenceEngine: Send {
    fn name(&self) -> &'static str;

    fn infer(&mut self, prompt: &str, options: &InferenceOptions) -> Result<String>;
}

/// Select an engine from a spec string. `stub://` yields the canned-reply
/// engine, optionally with a custom reply after the scheme.
pub fn select_engine(spec: &str) -> Result<Box<dyn InferenceEngine>> {
    if let Some(reply) = spec.strip_prefix("stub://") {
        let engine = if reply.is_empty() {
            StubEngine::default()
        } else {
            StubEngine::new(reply)
        };
        return Ok(Box::new(engine));
    }
    Err(anyhow!("unsupported inference engine '{}'", spec))
}

const STUB_REPLY: &str = "face detected, neutral expression";

/// Deterministic engine for tests and demo deployments. Honors the token
/// budget and stop sequences so callers exercise the real contract.
pub struct StubEngine {
    reply: String,
}

impl StubEngine {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
        }
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new(STUB_REPLY)
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, _prompt: &str, options: &InferenceOptions) -> Result<String> {
        let mut text = self.reply.as_str();
        for stop in &options.stop_sequences {
            if let Some(idx) = text.find(stop.as_str()) {
                text = &text[..idx];
            }
        }
        let truncated: Vec<&str> = text.split_whitespace().take(options.max_tokens).collect();
        Ok(truncated.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_returns_canned_reply() {
        let mut engine = StubEngine::default();
        let reply = engine
            .infer("prompt", &InferenceOptions::default())
            .expect("infer");
        assert_eq!(reply, "face detected, neutral expression");
    }

    #[test]
    fn stub_honors_stop_sequences() {
        let mut engine = StubEngine::new("first line\nsecond line");
        let reply = engine
            .infer("prompt", &InferenceOptions::default())
            .expect("infer");
        assert_eq!(reply, "first line");
    }

    #[test]
    fn stub_honors_token_budget() {
        let mut engine = StubEngine::new("one two three four");
        let options = InferenceOptions {
            max_tokens: 2,
            stop_sequences: Vec::new(),
        };
        assert_eq!(engine.infer("prompt", &options).expect("infer"), "one two");
    }

    #[test]
    fn select_engine_accepts_stub_scheme() {
        assert!(select_engine("stub://").is_ok());
        assert!(select_engine("stub://custom reply").is_ok());
        assert!(select_engine("llama:///model.gguf").is_err());
    }
}
