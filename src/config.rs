//! Configuration management
//!
//! All configuration is environment-derived and loaded once at startup.
//! A `.env` file in the working directory is honored for local development.

use anyhow::{bail, Result};

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// Model-provider credentials and endpoint
    pub openai: OpenAiConfig,
    /// Carrier (Twilio) credentials
    pub twilio: TwilioConfig,
    /// Realtime session defaults
    pub realtime: RealtimeDefaults,
    /// Deployment URLs
    pub deploy: DeployConfig,
    /// Control-webhook secrets
    pub control: ControlConfig,
}

/// Model-provider settings
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    /// API origin, overridable for testing
    pub api_base: String,
}

/// Carrier REST credentials
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub api_base: String,
}

/// Session defaults applied when neither carrier overrides nor runtime
/// overrides populate a field
#[derive(Debug, Clone)]
pub struct RealtimeDefaults {
    pub model: String,
    pub voice: Option<String>,
    pub modalities: Option<Vec<String>>,
    pub temperature: Option<f32>,
    /// Positive integer or "inf"
    pub max_output_tokens: Option<String>,
    /// "server_vad" or "none"
    pub turn_detection: Option<String>,
    pub vad_threshold: Option<f32>,
    pub vad_prefix_ms: Option<u32>,
    pub vad_silence_ms: Option<u32>,
    pub vad_create_response: Option<bool>,
    pub input_sample_rate: Option<u32>,
    /// Codec preference for non-telephony sessions
    pub audio_format: Option<String>,
    pub transcription_enabled: bool,
    pub transcription_model: Option<String>,
    pub transcription_language: Option<String>,
    pub transcription_prompt: Option<String>,
    /// "near_field" or "off"
    pub noise_reduction: Option<String>,
    pub instructions: Option<String>,
    pub prompt_id: Option<String>,
    pub prompt_version: Option<String>,
    /// Ephemeral credential lifetime in seconds
    pub expiry_seconds: u64,
}

/// Deployment URLs and control-document defaults
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Public origin this server is reachable at (https://...)
    pub public_base_url: Option<String>,
    /// Bridge WebSocket origin when the bridge runs on a separate host
    pub external_bridge_wss_url: Option<String>,
    /// Default control-document mode: "sip", "stream" or "simple"
    pub twiml_default_mode: Option<String>,
    pub sip_gateway_host: String,
}

/// Control-webhook authentication material
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Shared bearer token for POST /control
    pub secret: Option<String>,
    /// HMAC-SHA256 signing secret for signed-request envelopes
    pub signing_secret: Option<String>,
    /// Admin bearer token for /control/settings (min 32 bytes)
    pub admin_secret: Option<String>,
    /// Signed-request timestamp tolerance in seconds
    pub tolerance_seconds: u64,
}

const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com";
const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com";
const DEFAULT_MODEL: &str = "gpt-realtime";
const DEFAULT_SIP_GATEWAY: &str = "sip.api.openai.com";
const DEFAULT_EXPIRY_SECONDS: u64 = 600;
const DEFAULT_TOLERANCE_SECONDS: u64 = 300;

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Missing optional vars leave fields unset; only malformed numeric or
    /// boolean values are errors.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            openai: OpenAiConfig {
                api_key: env_opt("OPENAI_API_KEY"),
                org_id: env_opt("OPENAI_ORG_ID"),
                project_id: env_opt("OPENAI_PROJECT_ID"),
                api_base: env_opt("OPENAI_API_BASE")
                    .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string()),
            },
            twilio: TwilioConfig {
                account_sid: env_opt("TWILIO_ACCOUNT_SID"),
                auth_token: env_opt("TWILIO_AUTH_TOKEN"),
                from_number: env_opt("TWILIO_FROM_NUMBER"),
                api_base: env_opt("TWILIO_API_BASE")
                    .unwrap_or_else(|| DEFAULT_TWILIO_API_BASE.to_string()),
            },
            realtime: RealtimeDefaults {
                model: env_opt("REALTIME_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                voice: env_opt("REALTIME_VOICE"),
                modalities: env_opt("REALTIME_MODALITIES").map(|v| parse_list(&v)),
                temperature: env_parse("REALTIME_TEMPERATURE")?,
                max_output_tokens: env_opt("REALTIME_MAX_OUTPUT_TOKENS"),
                turn_detection: env_opt("REALTIME_TURN_DETECTION"),
                vad_threshold: env_parse("REALTIME_VAD_THRESHOLD")?,
                vad_prefix_ms: env_parse("REALTIME_VAD_PREFIX_MS")?,
                vad_silence_ms: env_parse("REALTIME_VAD_SILENCE_MS")?,
                vad_create_response: env_bool("REALTIME_VAD_CREATE_RESPONSE")?,
                input_sample_rate: env_parse("REALTIME_INPUT_SAMPLE_RATE")?,
                audio_format: env_opt("REALTIME_AUDIO_FORMAT"),
                transcription_enabled: env_bool("REALTIME_TRANSCRIPTION_ENABLED")?
                    .unwrap_or(false),
                transcription_model: env_opt("REALTIME_TRANSCRIPTION_MODEL"),
                transcription_language: env_opt("REALTIME_TRANSCRIPTION_LANGUAGE"),
                transcription_prompt: env_opt("REALTIME_TRANSCRIPTION_PROMPT"),
                noise_reduction: env_opt("REALTIME_NOISE_REDUCTION"),
                instructions: env_opt("REALTIME_INSTRUCTIONS"),
                prompt_id: env_opt("REALTIME_PROMPT_ID"),
                prompt_version: env_opt("REALTIME_PROMPT_VERSION"),
                expiry_seconds: env_parse("REALTIME_EXPIRY_SECONDS")?
                    .unwrap_or(DEFAULT_EXPIRY_SECONDS),
            },
            deploy: DeployConfig {
                public_base_url: env_opt("PUBLIC_BASE_URL"),
                external_bridge_wss_url: env_opt("EXTERNAL_BRIDGE_WSS_URL"),
                twiml_default_mode: env_opt("TWIML_DEFAULT_MODE"),
                sip_gateway_host: env_opt("SIP_GATEWAY_HOST")
                    .unwrap_or_else(|| DEFAULT_SIP_GATEWAY.to_string()),
            },
            control: ControlConfig {
                secret: env_opt("REALTIME_CONTROL_SECRET"),
                signing_secret: env_opt("REALTIME_CONTROL_SIGNING_SECRET"),
                admin_secret: env_opt("REALTIME_CONTROL_ADMIN_SECRET"),
                tolerance_seconds: env_parse("REALTIME_CONTROL_TOLERANCE_SECONDS")?
                    .unwrap_or(DEFAULT_TOLERANCE_SECONDS),
            },
        })
    }

    /// Require the model-provider API key
    pub fn require_api_key(&self) -> Result<&str> {
        match self.openai.api_key.as_deref() {
            Some(k) => Ok(k),
            None => bail!("OPENAI_API_KEY is not set"),
        }
    }

    /// Boolean matrix of recognized env vars for the env-check endpoint:
    /// (name, required, set)
    pub fn env_matrix() -> Vec<(&'static str, bool, bool)> {
        let required = ["OPENAI_API_KEY"];
        let optional = [
            "OPENAI_ORG_ID",
            "OPENAI_PROJECT_ID",
            "TWILIO_ACCOUNT_SID",
            "TWILIO_AUTH_TOKEN",
            "TWILIO_FROM_NUMBER",
            "PUBLIC_BASE_URL",
            "EXTERNAL_BRIDGE_WSS_URL",
            "TWIML_DEFAULT_MODE",
            "SIP_GATEWAY_HOST",
            "REALTIME_MODEL",
            "REALTIME_VOICE",
            "REALTIME_MODALITIES",
            "REALTIME_TEMPERATURE",
            "REALTIME_MAX_OUTPUT_TOKENS",
            "REALTIME_TURN_DETECTION",
            "REALTIME_VAD_THRESHOLD",
            "REALTIME_VAD_PREFIX_MS",
            "REALTIME_VAD_SILENCE_MS",
            "REALTIME_VAD_CREATE_RESPONSE",
            "REALTIME_INPUT_SAMPLE_RATE",
            "REALTIME_AUDIO_FORMAT",
            "REALTIME_TRANSCRIPTION_ENABLED",
            "REALTIME_TRANSCRIPTION_MODEL",
            "REALTIME_TRANSCRIPTION_LANGUAGE",
            "REALTIME_TRANSCRIPTION_PROMPT",
            "REALTIME_NOISE_REDUCTION",
            "REALTIME_INSTRUCTIONS",
            "REALTIME_PROMPT_ID",
            "REALTIME_PROMPT_VERSION",
            "REALTIME_EXPIRY_SECONDS",
            "REALTIME_CONTROL_SECRET",
            "REALTIME_CONTROL_SIGNING_SECRET",
            "REALTIME_CONTROL_ADMIN_SECRET",
            "REALTIME_CONTROL_TOLERANCE_SECONDS",
        ];
        let mut matrix = Vec::with_capacity(required.len() + optional.len());
        for name in required {
            matrix.push((name, true, env_opt(name).is_some()));
        }
        for name in optional {
            matrix.push((name, false, env_opt(name).is_some()));
        }
        matrix
    }
}

/// Read an env var, treating empty/whitespace values as unset
fn env_opt(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) => {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Parse an env var into T, erroring on malformed values
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_opt(name) {
        Some(v) => match v.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => bail!("invalid value for {}: {:?}", name, v),
        },
        None => Ok(None),
    }
}

/// Parse a boolean env var: 1/true/yes/on are true, 0/false/no/off are false
fn env_bool(name: &str) -> Result<Option<bool>> {
    match env_opt(name) {
        Some(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => bail!("invalid boolean for {}: {:?}", name, other),
        },
        None => Ok(None),
    }
}

/// Split a comma-separated list, dropping empty segments
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
