use serde::{Deserialize, Serialize};

use crate::types::{GenerationParameters, PalaverError, Result};

/// Inbound chat submission. The conversation history itself lives in the
/// session store; the caller only sends the new user message.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    pub assistant_id: String,
    pub parameters: GenerationParameters,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(PalaverError::Validation("session_id is required".into()).into());
        }
        if self.message.trim().is_empty() {
            return Err(PalaverError::Validation("message is required".into()).into());
        }
        if self.assistant_id.trim().is_empty() {
            return Err(PalaverError::Validation("assistant_id is required".into()).into());
        }
        if self.parameters.model.trim().is_empty() {
            return Err(PalaverError::Validation("parameters.model is required".into()).into());
        }
        if !(0.0..=2.0).contains(&self.parameters.temperature) {
            return Err(PalaverError::Validation(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.parameters.temperature
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CreateSessionRequest {
    pub name: String,
    pub assistant_id: String,
}

impl CreateSessionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.assistant_id.trim().is_empty() {
            return Err(
                PalaverError::Validation("name and assistant_id are required".into()).into(),
            );
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RenameSessionRequest {
    pub name: String,
}

impl RenameSessionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PalaverError::Validation("name is required".into()).into());
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug)]
pub struct LoginRequest {
    pub passcode: String,
}
