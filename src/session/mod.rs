//! Realtime session configuration
//!
//! The session record shared by the token minter, the control document and
//! the bridge. All fields are optional so layers can be merged: carrier
//! overrides first, then control-plane state, then environment defaults.

pub mod control;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub use control::ControlState;

/// μ-law 8 kHz, the only codec the carrier speaks
pub const G711_ULAW: &str = "g711_ulaw";

/// Turn-detection configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    /// Explicit commits only; the model never auto-creates responses
    None,
    /// Model-side voice-activity detection
    ServerVad {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        create_response: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interrupt_response: Option<bool>,
    },
}

// The wire protocol disables VAD with a literal null, not a tagged object
impl Serialize for TurnDetection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::None => serializer.serialize_none(),
            Self::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
                create_response,
                interrupt_response,
            } => {
                #[derive(Serialize)]
                struct ServerVadWire<'a> {
                    #[serde(rename = "type")]
                    kind: &'static str,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    threshold: &'a Option<f32>,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    prefix_padding_ms: &'a Option<u32>,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    silence_duration_ms: &'a Option<u32>,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    create_response: &'a Option<bool>,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    interrupt_response: &'a Option<bool>,
                }
                ServerVadWire {
                    kind: "server_vad",
                    threshold,
                    prefix_padding_ms,
                    silence_duration_ms,
                    create_response,
                    interrupt_response,
                }
                .serialize(serializer)
            }
        }
    }
}

/// Reference to a stored prompt, used instead of inline instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Input-audio transcription settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Input noise reduction; absent means off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoiseReduction {
    NearField,
}

/// Response token cap: a positive integer or unbounded ("inf")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxOutputTokens {
    Num(u32),
    Inf(String),
}

impl MaxOutputTokens {
    /// Parse from a config string ("inf" or a positive integer)
    pub fn parse(value: &str) -> Result<Self> {
        if value.eq_ignore_ascii_case("inf") || value.eq_ignore_ascii_case("unbounded") {
            return Ok(Self::Inf("inf".to_string()));
        }
        match value.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::Num(n)),
            _ => bail!("max output tokens must be a positive integer or \"inf\": {:?}", value),
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            Self::Num(n) => *n > 0,
            Self::Inf(s) => s == "inf",
        }
    }
}

/// Tool-choice directive: a mode string or a named function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Function {
        #[serde(rename = "type")]
        kind: String,
        name: String,
    },
}

/// Session configuration record.
///
/// Every field is optional; `merge_missing_from` layers records so the
/// bridge can apply carrier overrides on top of control-plane defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<MaxOutputTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_noise_reduction: Option<NoiseReduction>,
}

impl SessionConfig {
    /// Fill every unset field from `other`, leaving set fields alone
    pub fn merge_missing_from(&mut self, other: &SessionConfig) {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = other.$field.clone();
                }
            };
        }
        fill!(model);
        fill!(instructions);
        fill!(prompt);
        fill!(voice);
        fill!(modalities);
        fill!(input_audio_format);
        fill!(output_audio_format);
        fill!(input_sample_rate);
        fill!(tool_choice);
        fill!(tools);
        fill!(temperature);
        fill!(max_response_output_tokens);
        fill!(turn_detection);
        fill!(input_audio_transcription);
        fill!(input_audio_noise_reduction);
    }

    /// Validate ranges and cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                bail!("temperature must be within [0, 2]: {}", t);
            }
        }
        if let Some(tokens) = &self.max_response_output_tokens {
            if !tokens.is_valid() {
                bail!("max_response_output_tokens must be positive or \"inf\"");
            }
        }
        if let Some(TurnDetection::ServerVad {
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
            ..
        }) = &self.turn_detection
        {
            if let Some(th) = threshold {
                if !(0.0..=1.0).contains(th) {
                    bail!("VAD threshold must be within [0, 1]: {}", th);
                }
            }
            if let Some(p) = prefix_padding_ms {
                if *p > 2000 {
                    bail!("VAD prefix padding must be within [0, 2000] ms: {}", p);
                }
            }
            if let Some(s) = silence_duration_ms {
                if !(50..=5000).contains(s) {
                    bail!("VAD silence duration must be within [50, 5000] ms: {}", s);
                }
            }
        }
        if let Some(mode) = &self.tool_choice {
            if let ToolChoice::Mode(m) = mode {
                if !matches!(m.as_str(), "auto" | "required" | "none") {
                    bail!("tool_choice must be auto, required, none or a function: {:?}", m);
                }
            }
        }
        if let Some(modalities) = &self.modalities {
            for m in modalities {
                if !matches!(m.as_str(), "audio" | "text") {
                    bail!("unknown modality: {:?}", m);
                }
            }
        }
        Ok(())
    }

    /// A minted session must carry exactly one of instructions/prompt
    pub fn validate_for_mint(&self) -> Result<()> {
        self.validate()?;
        match (&self.instructions, &self.prompt) {
            (Some(_), Some(_)) => bail!("session carries both instructions and a prompt"),
            (None, None) => bail!("session carries neither instructions nor a prompt"),
            _ => Ok(()),
        }
    }

    /// Force the telephony codec on both directions, overriding any
    /// mismatched value. The carrier only speaks μ-law 8 kHz.
    pub fn force_telephony_audio(&mut self) {
        self.input_audio_format = Some(G711_ULAW.to_string());
        self.output_audio_format = Some(G711_ULAW.to_string());
        self.input_sample_rate = Some(8000);
    }

    /// Render as a `session.update` client event
    pub fn to_update_event(&self) -> serde_json::Value {
        let mut session = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = session.as_object_mut() {
            obj.insert("type".to_string(), serde_json::json!("realtime"));
        }
        serde_json::json!({
            "type": "session.update",
            "session": session,
        })
    }
}
