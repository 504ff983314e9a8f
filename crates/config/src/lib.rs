use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use core_types::{
    GatewayError, GatewayResult, ModelCapabilities, ModelDescriptor, ProviderConfig, ProviderKind,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

static ENV_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid placeholder pattern"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            providers: default_providers(),
        }
    }
}

impl GatewayConfig {
    /// Rejects configurations the gateway cannot be built from.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            let name = provider.name.trim();
            if name.is_empty() {
                return Err(GatewayError::InvalidConfiguration(
                    "provider name must not be empty".to_string(),
                ));
            }
            if !seen.insert(name) {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "provider `{name}` is configured more than once"
                )));
            }
            if provider.base_url.trim().is_empty() {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "provider `{name}` has no base_url"
                )));
            }
            if provider.max_requests_per_minute <= 0
                || u32::try_from(provider.max_requests_per_minute).is_err()
            {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "provider `{name}` has max_requests_per_minute {}, expected a positive value",
                    provider.max_requests_per_minute
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|provider| provider.enabled)
    }
}

/// Credential for `provider`: inline `api_key` (with `${VAR}` expansion), else
/// the variable named by `api_key_env`.
pub fn resolve_api_key(provider: &ProviderConfig) -> Option<String> {
    resolve_api_key_with(provider, |name| std::env::var(name).ok())
}

pub fn resolve_api_key_with(
    provider: &ProviderConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let key = match (&provider.api_key, &provider.api_key_env) {
        (Some(key), _) => expand_env_vars(key, &lookup),
        (None, Some(env_var)) => lookup(env_var)?,
        (None, None) => return None,
    };
    let key = key.trim();
    (!key.is_empty()).then(|| key.to_string())
}

/// Replaces `${VAR}` placeholders; unknown variables are left untouched.
pub fn expand_env_vars(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_PLACEHOLDER
        .replace_all(value, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn default_providers() -> Vec<ProviderConfig> {
    let tools = ModelCapabilities {
        tools: true,
        streaming: true,
        ..ModelCapabilities::default()
    };
    let multimodal = ModelCapabilities {
        vision: true,
        ..tools
    };
    let reasoning = ModelCapabilities {
        reasoning: true,
        ..multimodal
    };

    let mut openai = ProviderConfig::new(
        "openai",
        ProviderKind::OpenAi,
        "https://api.openai.com/v1",
        60,
    );
    openai.api_key_env = Some("OPENAI_API_KEY".to_string());
    openai.default_model = Some("gpt-4.1-mini".to_string());
    openai.models = vec![
        ModelDescriptor::new("gpt-4.1-mini", "GPT-4.1 mini", 1_047_576)
            .with_capabilities(multimodal),
        ModelDescriptor::new("gpt-4o", "GPT-4o", 128_000).with_capabilities(multimodal),
        ModelDescriptor::new("o3-mini", "o3-mini", 200_000).with_capabilities(ModelCapabilities {
            reasoning: true,
            ..tools
        }),
    ];

    let mut anthropic = ProviderConfig::new(
        "anthropic",
        ProviderKind::Anthropic,
        "https://api.anthropic.com",
        50,
    );
    anthropic.api_key_env = Some("ANTHROPIC_API_KEY".to_string());
    anthropic.default_model = Some("claude-sonnet-4-20250514".to_string());
    anthropic.models = vec![
        ModelDescriptor::new("claude-sonnet-4-20250514", "Claude Sonnet 4", 200_000)
            .with_capabilities(reasoning),
        ModelDescriptor::new("claude-3-5-haiku-20241022", "Claude Haiku 3.5", 200_000)
            .with_capabilities(multimodal),
    ];

    let mut gemini = ProviderConfig::new(
        "gemini",
        ProviderKind::Gemini,
        "https://generativelanguage.googleapis.com",
        15,
    );
    gemini.api_key_env = Some("GEMINI_API_KEY".to_string());
    gemini.default_model = Some("gemini-2.5-flash".to_string());
    gemini.models = vec![
        ModelDescriptor::new("gemini-2.5-flash", "Gemini 2.5 Flash", 1_048_576)
            .with_capabilities(reasoning),
        ModelDescriptor::new("gemini-2.5-pro", "Gemini 2.5 Pro", 1_048_576)
            .with_capabilities(reasoning),
    ];

    vec![openai, anthropic, gemini]
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("gateway.json"),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_default_location() -> Result<Self> {
        let mut dir = dirs::config_dir().context("failed to resolve config_dir")?;
        dir.push("llm-gateway");
        Ok(Self::from_dir(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the config, writing the default one first if none exists.
    pub fn load_or_init(&self) -> Result<GatewayConfig> {
        if !self.path.exists() {
            let config = GatewayConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let config = self.load()?;
        self.save(&config)?;
        Ok(config)
    }

    pub fn load(&self) -> Result<GatewayConfig> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: GatewayConfig =
            serde_json::from_str(&raw).context("failed to parse gateway config json")?;
        self.migrate(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &GatewayConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut GatewayConfig) {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating gateway config schema"
        );

        if config.providers.is_empty() {
            config.providers = default_providers();
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
    }
}
