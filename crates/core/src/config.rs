//! Runtime configuration.
//!
//! [`RenderConfig`] gathers the knobs that size the frame pipeline: how many
//! frames the CPU may run ahead, how large the descriptor heaps are, how many
//! command lists may exist and how long a fence wait may block before the
//! device is considered hung.
//!
//! Values come from `FRAMEFLIGHT_*` environment variables on top of the
//! defaults. The configuration is plain data and is passed explicitly to
//! whatever needs it.
//!
//! # Example
//!
//! ```
//! use frameflight_core::RenderConfig;
//!
//! let config = RenderConfig::from_lookup(|key| match key {
//!     "FRAMEFLIGHT_FRAMES_IN_FLIGHT" => Some("3".to_string()),
//!     _ => None,
//! })
//! .unwrap();
//! assert_eq!(config.frames_in_flight, 3);
//! ```

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable names.
const ENV_FRAMES_IN_FLIGHT: &str = "FRAMEFLIGHT_FRAMES_IN_FLIGHT";
const ENV_DESCRIPTOR_CAPACITY: &str = "FRAMEFLIGHT_DESCRIPTOR_CAPACITY";
const ENV_MAX_COMMAND_LISTS: &str = "FRAMEFLIGHT_MAX_COMMAND_LISTS";
const ENV_GPU_TIMEOUT_MS: &str = "FRAMEFLIGHT_GPU_TIMEOUT_MS";
const ENV_FRAMES: &str = "FRAMEFLIGHT_FRAMES";
const ENV_BACKEND: &str = "FRAMEFLIGHT_BACKEND";
const ENV_VALIDATION: &str = "FRAMEFLIGHT_VALIDATION";

/// Which GPU backend the application should drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// In-process software device
    #[default]
    Software,
    /// Vulkan through ash
    Vulkan,
}

impl BackendKind {
    /// Returns a human-readable name for the backend.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Software => "software",
            BackendKind::Vulkan => "vulkan",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "software" | "sw" => Ok(BackendKind::Software),
            "vulkan" | "vk" => Ok(BackendKind::Vulkan),
            other => Err(format!("unknown backend '{other}' (expected software or vulkan)")),
        }
    }
}

/// Frame pipeline configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderConfig {
    /// Maximum number of frames submitted but not yet completed.
    pub frames_in_flight: usize,
    /// Capacity of each descriptor heap kind.
    pub descriptor_capacity: u32,
    /// Upper bound on command lists a single recycler may create.
    pub max_command_lists: usize,
    /// How long a fence wait may block before it is reported as a hang.
    pub gpu_wait_timeout: Duration,
    /// Number of frames the headless driver renders.
    pub frame_count: u64,
    /// Backend selection.
    pub backend: BackendKind,
    /// Enable API validation where the backend supports it.
    pub validation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            descriptor_capacity: 4000,
            max_command_lists: 8,
            gpu_wait_timeout: Duration::from_secs(5),
            frame_count: 240,
            backend: BackendKind::Software,
            validation: false,
        }
    }
}

impl RenderConfig {
    /// Builds a configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparsable or unusable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// Keys that the lookup does not know keep their default value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for values that do not parse and
    /// [`Error::Config`] for values that parse but cannot work (zero sizes).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = parse_var::<usize, _>(&lookup, ENV_FRAMES_IN_FLIGHT)? {
            config.frames_in_flight = value;
        }
        if let Some(value) = parse_var::<u32, _>(&lookup, ENV_DESCRIPTOR_CAPACITY)? {
            config.descriptor_capacity = value;
        }
        if let Some(value) = parse_var::<usize, _>(&lookup, ENV_MAX_COMMAND_LISTS)? {
            config.max_command_lists = value;
        }
        if let Some(value) = parse_var::<u64, _>(&lookup, ENV_GPU_TIMEOUT_MS)? {
            config.gpu_wait_timeout = Duration::from_millis(value);
        }
        if let Some(value) = parse_var::<u64, _>(&lookup, ENV_FRAMES)? {
            config.frame_count = value;
        }
        if let Some(value) = parse_var::<BackendKind, _>(&lookup, ENV_BACKEND)? {
            config.backend = value;
        }
        if let Some(raw) = lookup(ENV_VALIDATION) {
            config.validation = parse_bool(ENV_VALIDATION, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can drive a frame pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first unusable setting.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::Config(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.descriptor_capacity == 0 {
            return Err(Error::Config(
                "descriptor_capacity must be at least 1".to_string(),
            ));
        }
        // One list records while the others are in flight.
        if self.max_command_lists <= self.frames_in_flight {
            return Err(Error::Config(format!(
                "max_command_lists ({}) must exceed frames_in_flight ({})",
                self.max_command_lists, self.frames_in_flight
            )));
        }
        if self.gpu_wait_timeout.is_zero() {
            return Err(Error::Config(
                "gpu_wait_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RenderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.descriptor_capacity, 4000);
        assert_eq!(config.backend, BackendKind::Software);
    }

    #[test]
    fn test_empty_lookup_yields_defaults() {
        let config = RenderConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RenderConfig::default());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = RenderConfig::from_lookup(lookup_from(&[
            (ENV_FRAMES_IN_FLIGHT, "3"),
            (ENV_DESCRIPTOR_CAPACITY, "128"),
            (ENV_MAX_COMMAND_LISTS, "6"),
            (ENV_GPU_TIMEOUT_MS, "250"),
            (ENV_FRAMES, "10"),
            (ENV_BACKEND, "Vulkan"),
            (ENV_VALIDATION, "on"),
        ]))
        .unwrap();

        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.descriptor_capacity, 128);
        assert_eq!(config.max_command_lists, 6);
        assert_eq!(config.gpu_wait_timeout, Duration::from_millis(250));
        assert_eq!(config.frame_count, 10);
        assert_eq!(config.backend, BackendKind::Vulkan);
        assert!(config.validation);
    }

    #[test]
    fn test_unparsable_value_is_reported() {
        let result = RenderConfig::from_lookup(lookup_from(&[(ENV_FRAMES_IN_FLIGHT, "two")]));
        match result {
            Err(Error::InvalidValue { key, value, .. }) => {
                assert_eq!(key, ENV_FRAMES_IN_FLIGHT);
                assert_eq!(value, "two");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_backend_is_reported() {
        let result = RenderConfig::from_lookup(lookup_from(&[(ENV_BACKEND, "metal")]));
        assert!(matches!(result, Err(Error::InvalidValue { .. })));
    }

    #[test]
    fn test_zero_sizes_are_rejected() {
        let result = RenderConfig::from_lookup(lookup_from(&[(ENV_FRAMES_IN_FLIGHT, "0")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = RenderConfig::from_lookup(lookup_from(&[(ENV_DESCRIPTOR_CAPACITY, "0")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = RenderConfig::from_lookup(lookup_from(&[(ENV_GPU_TIMEOUT_MS, "0")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_command_lists_must_outnumber_frames_in_flight() {
        let result = RenderConfig::from_lookup(lookup_from(&[
            (ENV_FRAMES_IN_FLIGHT, "4"),
            (ENV_MAX_COMMAND_LISTS, "4"),
        ]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(BackendKind::Software.name(), "software");
        assert_eq!(BackendKind::Vulkan.name(), "vulkan");
        assert_eq!("vk".parse::<BackendKind>(), Ok(BackendKind::Vulkan));
    }
}
