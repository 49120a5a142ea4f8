//! # Runtime configuration
//!
//! Central settings for the gateway, loaded from `GRIOT_`-prefixed
//! environment variables with sensible defaults. Every knob the runtime
//! recognizes lives here; nothing else in the crate reads the environment.
//!
//! ## Examples
//!
//! ```rust
//! use griot_live::Settings;
//!
//! let settings = Settings::from_env();
//! assert_eq!(settings.audio_sample_rate_input, 16_000);
//! assert!(settings.cultural_reject_threshold < settings.cultural_confidence_threshold);
//! ```

use std::env;

/// Application settings resolved once at startup.
///
/// Field groups:
/// - tenant identity (`project_id`, `region`)
/// - model selection (`live_model`, `text_model`, `image_model`, `text_model_url`)
/// - persistence hints (`session_ttl_hours`, `media_bucket`, `max_session_turns`)
/// - streaming contract (audio framing, queue watermarks, timeouts)
/// - cultural-grounding policy thresholds
#[derive(Debug, Clone)]
pub struct Settings {
    /// External model tenant project.
    pub project_id: String,
    /// External model tenant region.
    pub region: String,

    /// Live (duplex) model variant.
    pub live_model: String,
    /// Text model variant used by sub-agents.
    pub text_model: String,
    /// Image model variant used by the visual agent.
    pub image_model: String,
    /// Base URL of the OpenAI-compatible text endpoint.
    pub text_model_url: String,
    /// Pre-warm count for text-model clients.
    pub pool_size: usize,

    /// Persistence retention hint, in hours.
    pub session_ttl_hours: u64,
    /// Target bucket for generated media uploads.
    pub media_bucket: String,

    /// Verbose formatter and extra diagnostics.
    pub debug: bool,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Hard cap on the persisted turn log length.
    pub max_session_turns: usize,
    /// Connection admission hint.
    pub max_concurrent_sessions: usize,

    /// Audio framing contract with the live model.
    pub audio_chunk_duration_ms: u64,
    pub audio_sample_rate_input: u32,
    pub audio_sample_rate_output: u32,

    /// Output-queue sizing.
    pub stream_buffer_high_watermark: usize,
    pub stream_buffer_low_watermark: usize,

    /// Default per-dispatch ceiling, in seconds.
    pub agent_timeout_seconds: f64,

    /// Below this confidence the cultural validator escalates to the model.
    pub cultural_confidence_threshold: f64,
    /// Below this confidence the validator hedges the text.
    pub cultural_reject_threshold: f64,

    /// Listen address for the gateway.
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_id: "griot-live".to_string(),
            region: "us-central1".to_string(),
            live_model: "live-preview".to_string(),
            text_model: "flash".to_string(),
            image_model: "imagine-3".to_string(),
            text_model_url: "http://localhost:8000/v1".to_string(),
            pool_size: 3,
            session_ttl_hours: 24,
            media_bucket: "griot-media".to_string(),
            debug: false,
            log_level: "info".to_string(),
            max_session_turns: 100,
            max_concurrent_sessions: 200,
            audio_chunk_duration_ms: 100,
            audio_sample_rate_input: 16_000,
            audio_sample_rate_output: 24_000,
            stream_buffer_high_watermark: 50,
            stream_buffer_low_watermark: 10,
            agent_timeout_seconds: 5.0,
            cultural_confidence_threshold: 0.7,
            cultural_reject_threshold: 0.4,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// Unparseable numeric values fall back to the default rather than
    /// failing startup; the gateway should come up even with a sloppy
    /// environment, and the effective values are logged by the binary.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Self {
            project_id: env_string("GRIOT_PROJECT_ID", d.project_id),
            region: env_string("GRIOT_REGION", d.region),
            live_model: env_string("GRIOT_LIVE_MODEL", d.live_model),
            text_model: env_string("GRIOT_TEXT_MODEL", d.text_model),
            image_model: env_string("GRIOT_IMAGE_MODEL", d.image_model),
            text_model_url: env_string("GRIOT_TEXT_MODEL_URL", d.text_model_url),
            pool_size: env_parse("GRIOT_POOL_SIZE", d.pool_size),
            session_ttl_hours: env_parse("GRIOT_SESSION_TTL_HOURS", d.session_ttl_hours),
            media_bucket: env_string("GRIOT_MEDIA_BUCKET", d.media_bucket),
            debug: env_parse("GRIOT_DEBUG", d.debug),
            log_level: env_string("GRIOT_LOG_LEVEL", d.log_level),
            max_session_turns: env_parse("GRIOT_MAX_SESSION_TURNS", d.max_session_turns),
            max_concurrent_sessions: env_parse(
                "GRIOT_MAX_CONCURRENT_SESSIONS",
                d.max_concurrent_sessions,
            ),
            audio_chunk_duration_ms: env_parse(
                "GRIOT_AUDIO_CHUNK_DURATION_MS",
                d.audio_chunk_duration_ms,
            ),
            audio_sample_rate_input: env_parse(
                "GRIOT_AUDIO_SAMPLE_RATE_INPUT",
                d.audio_sample_rate_input,
            ),
            audio_sample_rate_output: env_parse(
                "GRIOT_AUDIO_SAMPLE_RATE_OUTPUT",
                d.audio_sample_rate_output,
            ),
            stream_buffer_high_watermark: env_parse(
                "GRIOT_STREAM_BUFFER_HIGH_WATERMARK",
                d.stream_buffer_high_watermark,
            ),
            stream_buffer_low_watermark: env_parse(
                "GRIOT_STREAM_BUFFER_LOW_WATERMARK",
                d.stream_buffer_low_watermark,
            ),
            agent_timeout_seconds: env_parse(
                "GRIOT_AGENT_TIMEOUT_SECONDS",
                d.agent_timeout_seconds,
            ),
            cultural_confidence_threshold: env_parse(
                "GRIOT_CULTURAL_CONFIDENCE_THRESHOLD",
                d.cultural_confidence_threshold,
            ),
            cultural_reject_threshold: env_parse(
                "GRIOT_CULTURAL_REJECT_THRESHOLD",
                d.cultural_reject_threshold,
            ),
            bind_addr: env_string("GRIOT_BIND_ADDR", d.bind_addr),
        }
    }
}

fn env_string(key: &str, fallback: String) -> String {
    env::var(key).unwrap_or(fallback)
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}
