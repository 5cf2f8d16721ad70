// crates/core/src/ai_client.rs

use anyhow::Result;

/// Abstract text-generation client used by the synthesis oracle.
///
/// Implementations can use Azure Foundry, OpenAI, Ollama, etc.
pub trait AiClient {
    /// Send `prompt` under the given system `instructions`, return the reply text.
    fn complete(&self, instructions: &str, prompt: &str) -> Result<String>;
}

impl<C: AiClient + ?Sized> AiClient for &C {
    fn complete(&self, instructions: &str, prompt: &str) -> Result<String> {
        (**self).complete(instructions, prompt)
    }
}
