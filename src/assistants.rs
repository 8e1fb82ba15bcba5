use serde::{Deserialize, Serialize};

use crate::types::{PalaverError, ReasoningEffort, Result, Verbosity};

pub const ASSISTANTS_CONFIG_ENV: &str = "ASSISTANTS_CONFIG";

/// Static assistant configuration: system prompt, retrieval stores, and
/// default generation parameters. Loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assistant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vector_store_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_parameters: Option<AssistantDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AssistantDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,
}

/// Listing entry for selection UIs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AssistantOption {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct AssistantRegistry {
    assistants: Vec<Assistant>,
}

impl AssistantRegistry {
    /// Loads the registry from `ASSISTANTS_CONFIG`. Missing or invalid
    /// configuration falls back to the built-in example assistant so the
    /// server stays usable.
    pub fn from_env() -> Self {
        match std::env::var(ASSISTANTS_CONFIG_ENV) {
            Ok(raw) if !raw.trim().is_empty() => match Self::parse(&raw) {
                Ok(registry) => {
                    tracing::info!(
                        "Loaded {} assistant(s) from {}",
                        registry.assistants.len(),
                        ASSISTANTS_CONFIG_ENV
                    );
                    registry
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to parse {}: {}; falling back to the example assistant",
                        ASSISTANTS_CONFIG_ENV,
                        e
                    );
                    Self::fallback()
                }
            },
            _ => {
                tracing::warn!(
                    "{} is not set; using the built-in example assistant",
                    ASSISTANTS_CONFIG_ENV
                );
                Self::fallback()
            }
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let assistants: Vec<Assistant> =
            serde_json::from_str(raw).map_err(PalaverError::Serialization)?;

        for assistant in &assistants {
            if assistant.id.trim().is_empty() || assistant.name.trim().is_empty() {
                return Err(PalaverError::Validation(format!(
                    "Invalid assistant configuration: {:?}",
                    assistant
                ))
                .into());
            }
        }

        let registry = Self { assistants };
        for warning in registry.config_warnings() {
            tracing::warn!("Assistant config: {}", warning);
        }
        Ok(registry)
    }

    pub fn new(assistants: Vec<Assistant>) -> Self {
        Self { assistants }
    }

    fn fallback() -> Self {
        Self {
            assistants: vec![Assistant {
                id: "asst_example".into(),
                name: "Example Assistant".into(),
                description: "A sample assistant for demonstration purposes. Configure your \
                              real assistants in the ASSISTANTS_CONFIG environment variable."
                    .into(),
                vector_store_ids: vec!["vs_example".into()],
                model: None,
                default_parameters: None,
                system_message: None,
            }],
        }
    }

    pub fn lookup(&self, id: &str) -> Option<&Assistant> {
        self.assistants.iter().find(|a| a.id == id)
    }

    pub fn vector_store_ids(&self, id: &str) -> &[String] {
        match self.lookup(id) {
            Some(a) => &a.vector_store_ids,
            None => &[],
        }
    }

    pub fn supports_file_search(&self, id: &str) -> bool {
        !self.vector_store_ids(id).is_empty()
    }

    pub fn options(&self) -> Vec<AssistantOption> {
        self.assistants
            .iter()
            .map(|a| AssistantOption {
                id: a.id.clone(),
                name: a.name.clone(),
                description: a.description.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.assistants.is_empty()
    }

    /// Non-fatal configuration problems: duplicate ids and store ids that do
    /// not look like vector store identifiers.
    pub fn config_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (i, assistant) in self.assistants.iter().enumerate() {
            if self.assistants[..i].iter().any(|a| a.id == assistant.id) {
                warnings.push(format!("duplicate assistant id: {}", assistant.id));
            }
            for store_id in &assistant.vector_store_ids {
                if !store_id.starts_with("vs_") {
                    warnings.push(format!(
                        "vector store id for {} does not start with 'vs_': {}",
                        assistant.name, store_id
                    ));
                }
            }
        }

        warnings
    }
}
