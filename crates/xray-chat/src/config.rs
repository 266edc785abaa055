//! Runtime configuration for the chat orchestrator.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (e.g. `XRAY_VISION_RECOVERY_TIMEOUT_SECS`)
//! 2. Built-in defaults
//!
//! Values that fail to parse are logged and ignored; [`ChatConfig::validate`]
//! catches values that parse but make no sense.
//!
//! | Variable                              | Default | Used by              |
//! |---------------------------------------|---------|----------------------|
//! | `XRAY_DETECTOR_FAILURE_THRESHOLD`     | 3       | detector breaker     |
//! | `XRAY_DETECTOR_RECOVERY_TIMEOUT_SECS` | 60      | detector breaker     |
//! | `XRAY_DETECTOR_SUCCESS_THRESHOLD`     | 2       | detector breaker     |
//! | `XRAY_VISION_FAILURE_THRESHOLD`       | 3       | vision-model breaker |
//! | `XRAY_VISION_RECOVERY_TIMEOUT_SECS`   | 120     | vision-model breaker |
//! | `XRAY_VISION_SUCCESS_THRESHOLD`       | 2       | vision-model breaker |
//! | `XRAY_RETRY_MAX_ATTEMPTS`             | 3       | retry policy         |
//! | `XRAY_RETRY_MIN_WAIT_SECS`            | 1.0     | retry policy         |
//! | `XRAY_RETRY_MAX_WAIT_SECS`            | 10.0    | retry policy         |
//! | `XRAY_STREAM_HEARTBEAT_SECS`          | 15      | streaming session    |
//! | `XRAY_STREAM_TIMEOUT_SECS`            | 300     | streaming session    |
//! | `XRAY_STREAM_QUEUE_CAPACITY`          | 256     | streaming session    |
//! | `XRAY_DECISION_WINDOW_CHARS`          | 10      | stream classifier    |
//! | `XRAY_DECISION_MAX_TOKENS`            | 512     | phase 1              |
//! | `XRAY_RESPONSE_MAX_TOKENS`            | 2048    | phase 2              |
//! | `XRAY_CONTEXT_MAX_TOKENS`             | 4096    | history truncation   |
//! | `XRAY_FUSION_ENABLED`                 | true    | detection fusion     |
//! | `XRAY_FUSION_IOU_THRESHOLD`           | 0.5     | detection fusion     |
//! | `XRAY_FUSION_SKIP_THRESHOLD`          | 0.0     | detection fusion     |
//! | `XRAY_MODEL_LABEL`                    | `qwen-vl-tools` | `message_start` metadata |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use xray_core::fusion::FusionParams;
use xray_core::resilience::{CircuitBreakerConfig, RetryPolicy};

const ENV_DETECTOR_FAILURE_THRESHOLD: &str = "XRAY_DETECTOR_FAILURE_THRESHOLD";
const ENV_DETECTOR_RECOVERY_TIMEOUT: &str = "XRAY_DETECTOR_RECOVERY_TIMEOUT_SECS";
const ENV_DETECTOR_SUCCESS_THRESHOLD: &str = "XRAY_DETECTOR_SUCCESS_THRESHOLD";
const ENV_VISION_FAILURE_THRESHOLD: &str = "XRAY_VISION_FAILURE_THRESHOLD";
const ENV_VISION_RECOVERY_TIMEOUT: &str = "XRAY_VISION_RECOVERY_TIMEOUT_SECS";
const ENV_VISION_SUCCESS_THRESHOLD: &str = "XRAY_VISION_SUCCESS_THRESHOLD";
const ENV_RETRY_MAX_ATTEMPTS: &str = "XRAY_RETRY_MAX_ATTEMPTS";
const ENV_RETRY_MIN_WAIT: &str = "XRAY_RETRY_MIN_WAIT_SECS";
const ENV_RETRY_MAX_WAIT: &str = "XRAY_RETRY_MAX_WAIT_SECS";
const ENV_STREAM_HEARTBEAT: &str = "XRAY_STREAM_HEARTBEAT_SECS";
const ENV_STREAM_TIMEOUT: &str = "XRAY_STREAM_TIMEOUT_SECS";
const ENV_STREAM_QUEUE_CAPACITY: &str = "XRAY_STREAM_QUEUE_CAPACITY";
const ENV_DECISION_WINDOW: &str = "XRAY_DECISION_WINDOW_CHARS";
const ENV_DECISION_MAX_TOKENS: &str = "XRAY_DECISION_MAX_TOKENS";
const ENV_RESPONSE_MAX_TOKENS: &str = "XRAY_RESPONSE_MAX_TOKENS";
const ENV_CONTEXT_MAX_TOKENS: &str = "XRAY_CONTEXT_MAX_TOKENS";
const ENV_FUSION_ENABLED: &str = "XRAY_FUSION_ENABLED";
const ENV_FUSION_IOU: &str = "XRAY_FUSION_IOU_THRESHOLD";
const ENV_FUSION_SKIP: &str = "XRAY_FUSION_SKIP_THRESHOLD";
const ENV_MODEL_LABEL: &str = "XRAY_MODEL_LABEL";

const DEFAULT_MODEL_LABEL: &str = "qwen-vl-tools";

/// Streaming session tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Interval between `ping` events while a session is active.
    pub heartbeat_interval: Duration,
    /// A session with no progress for this long is torn down.
    pub timeout: Duration,
    /// Capacity of the per-session event queue.
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(300),
            queue_capacity: 256,
        }
    }
}

/// Token budgets and the phase-1 decision window.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Characters observed before classifying a phase-1 response.
    pub decision_window_chars: usize,
    pub decision_max_tokens: u32,
    pub response_max_tokens: u32,
    /// Budget for system prompt plus history.
    pub context_max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            decision_window_chars: 10,
            decision_max_tokens: 512,
            response_max_tokens: 2048,
            context_max_tokens: 4096,
        }
    }
}

/// Everything the service container and orchestrator need.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub detector_breaker: CircuitBreakerConfig,
    pub vision_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub stream: StreamConfig,
    pub fusion: FusionParams,
    pub generation: GenerationConfig,
    /// Reported as `model` in `message_start` metadata.
    pub model_label: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            detector_breaker: CircuitBreakerConfig::detector(),
            vision_breaker: CircuitBreakerConfig::vision_model(),
            retry: RetryPolicy::default(),
            stream: StreamConfig::default(),
            fusion: FusionParams::default(),
            generation: GenerationConfig::default(),
            model_label: DEFAULT_MODEL_LABEL.to_string(),
        }
    }
}

impl ChatConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |key: &str| lookup(key);

        let breaker = |base: CircuitBreakerConfig, failures: &str, timeout: &str, successes: &str| {
            CircuitBreakerConfig {
                failure_threshold: parse_var(&get, failures, base.failure_threshold),
                recovery_timeout: Duration::from_secs(parse_var(
                    &get,
                    timeout,
                    base.recovery_timeout.as_secs(),
                )),
                success_threshold: parse_var(&get, successes, base.success_threshold),
            }
        };

        let retry = RetryPolicy {
            max_attempts: parse_var(&get, ENV_RETRY_MAX_ATTEMPTS, d.retry.max_attempts),
            min_wait: secs_var(&get, ENV_RETRY_MIN_WAIT, d.retry.min_wait),
            max_wait: secs_var(&get, ENV_RETRY_MAX_WAIT, d.retry.max_wait),
            retry_on: d.retry.retry_on.clone(),
        };

        Self {
            detector_breaker: breaker(
                d.detector_breaker,
                ENV_DETECTOR_FAILURE_THRESHOLD,
                ENV_DETECTOR_RECOVERY_TIMEOUT,
                ENV_DETECTOR_SUCCESS_THRESHOLD,
            ),
            vision_breaker: breaker(
                d.vision_breaker,
                ENV_VISION_FAILURE_THRESHOLD,
                ENV_VISION_RECOVERY_TIMEOUT,
                ENV_VISION_SUCCESS_THRESHOLD,
            ),
            retry,
            stream: StreamConfig {
                heartbeat_interval: secs_var(&get, ENV_STREAM_HEARTBEAT, d.stream.heartbeat_interval),
                timeout: secs_var(&get, ENV_STREAM_TIMEOUT, d.stream.timeout),
                queue_capacity: parse_var(&get, ENV_STREAM_QUEUE_CAPACITY, d.stream.queue_capacity),
            },
            fusion: FusionParams {
                enabled: parse_var(&get, ENV_FUSION_ENABLED, d.fusion.enabled),
                iou_threshold: parse_var(&get, ENV_FUSION_IOU, d.fusion.iou_threshold),
                skip_threshold: parse_var(&get, ENV_FUSION_SKIP, d.fusion.skip_threshold),
                decay_unmatched: d.fusion.decay_unmatched,
            },
            generation: GenerationConfig {
                decision_window_chars: parse_var(
                    &get,
                    ENV_DECISION_WINDOW,
                    d.generation.decision_window_chars,
                ),
                decision_max_tokens: parse_var(
                    &get,
                    ENV_DECISION_MAX_TOKENS,
                    d.generation.decision_max_tokens,
                ),
                response_max_tokens: parse_var(
                    &get,
                    ENV_RESPONSE_MAX_TOKENS,
                    d.generation.response_max_tokens,
                ),
                context_max_tokens: parse_var(
                    &get,
                    ENV_CONTEXT_MAX_TOKENS,
                    d.generation.context_max_tokens,
                ),
            },
            model_label: get(ENV_MODEL_LABEL)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(d.model_label),
        }
    }

    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        self.detector_breaker
            .validate()
            .map_err(|e| format!("detector breaker: {e}"))?;
        self.vision_breaker
            .validate()
            .map_err(|e| format!("vision breaker: {e}"))?;
        self.retry.validate().map_err(|e| format!("retry: {e}"))?;
        self.fusion.validate().map_err(|e| format!("fusion: {e}"))?;

        if self.stream.heartbeat_interval.is_zero() {
            return Err("stream: heartbeat_interval must be > 0".to_string());
        }
        if self.stream.timeout.is_zero() {
            return Err("stream: timeout must be > 0".to_string());
        }
        if self.stream.queue_capacity == 0 {
            return Err("stream: queue_capacity must be > 0".to_string());
        }
        if self.generation.decision_window_chars == 0 {
            return Err("generation: decision_window_chars must be > 0".to_string());
        }
        if self.generation.decision_max_tokens == 0 || self.generation.response_max_tokens == 0 {
            return Err("generation: token budgets must be > 0".to_string());
        }
        if self.generation.context_max_tokens <= crate::orchestrator::prompts::RESPONSE_RESERVE_TOKENS {
            return Err(format!(
                "generation: context_max_tokens must exceed the {} token response reserve",
                crate::orchestrator::prompts::RESPONSE_RESERVE_TOKENS
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = key, value = %raw, "ignoring unparseable configuration value");
                default
            }
        },
        None => default,
    }
}

fn secs_var<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let secs: f64 = parse_var(lookup, key, default.as_secs_f64());
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
        warn!(var = key, secs, "ignoring out-of-range duration");
        default
    })
}
