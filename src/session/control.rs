//! Process-wide session configuration state
//!
//! Two layers: environment-derived defaults frozen at startup and runtime
//! overrides set through the settings endpoint. Overrides live for the
//! process lifetime; a restart reverts to defaults.

use std::sync::RwLock;

use tracing::warn;

use crate::config::RealtimeDefaults;

use super::{
    MaxOutputTokens, NoiseReduction, PromptRef, SessionConfig, TranscriptionConfig, TurnDetection,
};

/// Shared control-plane state
pub struct ControlState {
    defaults: SessionConfig,
    overrides: RwLock<Option<SessionConfig>>,
}

impl ControlState {
    /// Build from environment defaults
    pub fn from_defaults(realtime: &RealtimeDefaults) -> Self {
        Self {
            defaults: session_from_defaults(realtime),
            overrides: RwLock::new(None),
        }
    }

    /// The frozen default layer
    pub fn defaults(&self) -> &SessionConfig {
        &self.defaults
    }

    /// Snapshot of the override layer
    pub fn overrides(&self) -> Option<SessionConfig> {
        self.overrides.read().expect("control overrides lock").clone()
    }

    /// Replace the override layer (None clears it)
    pub fn set_overrides(&self, overrides: Option<SessionConfig>) {
        *self.overrides.write().expect("control overrides lock") = overrides;
    }

    /// Effective configuration: override fields where set, defaults
    /// elsewhere
    pub fn current(&self) -> SessionConfig {
        let mut effective = self.overrides().unwrap_or_default();
        effective.merge_missing_from(&self.defaults);
        effective
    }

    /// Effective configuration rendered as a `session.update` event,
    /// ready to send on a model WebSocket
    pub fn current_update_event(&self) -> serde_json::Value {
        self.current().to_update_event()
    }
}

/// Translate env-derived defaults into a session record
fn session_from_defaults(realtime: &RealtimeDefaults) -> SessionConfig {
    let max_tokens = realtime.max_output_tokens.as_deref().and_then(|raw| {
        match MaxOutputTokens::parse(raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Ignoring REALTIME_MAX_OUTPUT_TOKENS: {}", e);
                None
            }
        }
    });

    let turn_detection = match realtime.turn_detection.as_deref() {
        Some("none") | Some("off") => Some(TurnDetection::None),
        // Server VAD is the default for voice sessions
        _ => Some(TurnDetection::ServerVad {
            threshold: realtime.vad_threshold,
            prefix_padding_ms: realtime.vad_prefix_ms,
            silence_duration_ms: realtime.vad_silence_ms,
            create_response: realtime.vad_create_response,
            interrupt_response: None,
        }),
    };

    let input_audio_transcription = if realtime.transcription_enabled {
        Some(TranscriptionConfig {
            model: realtime
                .transcription_model
                .clone()
                .unwrap_or_else(|| "whisper-1".to_string()),
            language: realtime.transcription_language.clone(),
            prompt: realtime.transcription_prompt.clone(),
        })
    } else {
        None
    };

    let input_audio_noise_reduction = match realtime.noise_reduction.as_deref() {
        Some("near_field") => Some(NoiseReduction::NearField),
        _ => None,
    };

    // Prompt reference wins over inline instructions when both are set
    let (instructions, prompt) = match &realtime.prompt_id {
        Some(id) => (
            None,
            Some(PromptRef {
                id: id.clone(),
                version: realtime.prompt_version.clone(),
            }),
        ),
        None => (realtime.instructions.clone(), None),
    };

    SessionConfig {
        model: Some(realtime.model.clone()),
        instructions,
        prompt,
        voice: realtime.voice.clone(),
        modalities: realtime.modalities.clone(),
        input_audio_format: realtime.audio_format.clone(),
        output_audio_format: realtime.audio_format.clone(),
        input_sample_rate: realtime.input_sample_rate,
        tool_choice: None,
        tools: None,
        temperature: realtime.temperature,
        max_response_output_tokens: max_tokens,
        turn_detection,
        input_audio_transcription,
        input_audio_noise_reduction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> RealtimeDefaults {
        RealtimeDefaults {
            model: "gpt-realtime".to_string(),
            voice: Some("marin".to_string()),
            modalities: Some(vec!["audio".to_string(), "text".to_string()]),
            temperature: Some(0.8),
            max_output_tokens: Some("inf".to_string()),
            turn_detection: None,
            vad_threshold: Some(0.5),
            vad_prefix_ms: Some(300),
            vad_silence_ms: Some(500),
            vad_create_response: Some(true),
            input_sample_rate: None,
            audio_format: None,
            transcription_enabled: true,
            transcription_model: None,
            transcription_language: Some("en".to_string()),
            transcription_prompt: None,
            noise_reduction: Some("near_field".to_string()),
            instructions: Some("You answer the phone.".to_string()),
            prompt_id: None,
            prompt_version: None,
            expiry_seconds: 600,
        }
    }

    #[test]
    fn test_defaults_populate_session() {
        let state = ControlState::from_defaults(&defaults());
        let current = state.current();
        assert_eq!(current.model.as_deref(), Some("gpt-realtime"));
        assert_eq!(current.voice.as_deref(), Some("marin"));
        assert!(matches!(
            current.turn_detection,
            Some(TurnDetection::ServerVad { .. })
        ));
        assert_eq!(
            current.input_audio_transcription.as_ref().map(|t| t.model.as_str()),
            Some("whisper-1")
        );
    }

    #[test]
    fn test_overrides_win_and_clear() {
        let state = ControlState::from_defaults(&defaults());
        state.set_overrides(Some(SessionConfig {
            voice: Some("cedar".to_string()),
            ..Default::default()
        }));
        let current = state.current();
        assert_eq!(current.voice.as_deref(), Some("cedar"));
        // Unset override fields still come from defaults
        assert_eq!(current.temperature, Some(0.8));

        state.set_overrides(None);
        assert_eq!(state.current().voice.as_deref(), Some("marin"));
    }

    #[test]
    fn test_prompt_id_replaces_instructions() {
        let mut d = defaults();
        d.prompt_id = Some("pmpt_7".to_string());
        d.prompt_version = Some("3".to_string());
        let state = ControlState::from_defaults(&d);
        let current = state.current();
        assert!(current.instructions.is_none());
        assert_eq!(current.prompt.as_ref().map(|p| p.id.as_str()), Some("pmpt_7"));
    }

    #[test]
    fn test_update_event_is_fully_formed() {
        let state = ControlState::from_defaults(&defaults());
        let event = state.current_update_event();
        assert_eq!(event["type"], "session.update");
        assert_eq!(event["session"]["type"], "realtime");
        assert_eq!(event["session"]["turn_detection"]["type"], "server_vad");
    }

    #[test]
    fn test_disabled_turn_detection_sends_null() {
        let mut d = defaults();
        d.turn_detection = Some("none".to_string());
        let state = ControlState::from_defaults(&d);
        assert_eq!(state.current().turn_detection, Some(TurnDetection::None));

        let event = state.current_update_event();
        let session = event["session"].as_object().unwrap();
        assert!(session.contains_key("turn_detection"));
        assert_eq!(session["turn_detection"], serde_json::Value::Null);
    }
}
