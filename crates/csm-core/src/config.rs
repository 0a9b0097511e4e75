//! Agent configuration
//!
//! Defaults can be overridden from YAML or from `CSM_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{CoreError, CoreResult};

/// What to do when a flow terminates with nothing on the execution stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootTerminationPolicy {
    /// Fail the turn
    #[default]
    Error,
    /// Log and leave the agent where it is
    Ignore,
}

impl FromStr for RootTerminationPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(RootTerminationPolicy::Error),
            "ignore" => Ok(RootTerminationPolicy::Ignore),
            other => Err(CoreError::ConfigurationError(format!("Unknown root termination policy '{}'", other))),
        }
    }
}

impl fmt::Display for RootTerminationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RootTerminationPolicy::Error => "error",
            RootTerminationPolicy::Ignore => "ignore",
        })
    }
}

/// Runtime limits and policies of a conversational agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on automatic steps per turn; 0 (the default) leaves chains unbounded
    #[serde(default)]
    pub max_transient_steps: usize,

    /// Reject machines whose target analysis reports issues
    #[serde(default)]
    pub strict_targets: bool,

    /// Policy for terminations with an empty execution stack
    #[serde(default)]
    pub root_termination: RootTerminationPolicy,
}

impl AgentConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(steps) = lookup("CSM_MAX_TRANSIENT_STEPS") {
            if let Ok(steps) = steps.parse::<usize>() {
                config.max_transient_steps = steps;
            } else {
                warn!("Invalid CSM_MAX_TRANSIENT_STEPS value: {}", steps);
            }
        }

        if let Some(strict) = lookup("CSM_STRICT_TARGETS") {
            match strict.to_lowercase().as_str() {
                "true" | "1" => config.strict_targets = true,
                "false" | "0" => config.strict_targets = false,
                _ => warn!("Invalid CSM_STRICT_TARGETS value: {}", strict),
            }
        }

        if let Some(policy) = lookup("CSM_ROOT_TERMINATION") {
            if let Ok(policy) = policy.parse() {
                config.root_termination = policy;
            } else {
                warn!("Invalid CSM_ROOT_TERMINATION value: {}", policy);
            }
        }

        config
    }

    /// Parse configuration from YAML; missing keys take their defaults
    pub fn from_yaml_str(yaml: &str) -> CoreResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| CoreError::ConfigurationError(e.to_string()))
    }

    /// Builder: set the transient step bound
    pub fn with_max_transient_steps(mut self, steps: usize) -> Self {
        self.max_transient_steps = steps;
        self
    }

    /// Builder: enable or disable strict target checking
    pub fn with_strict_targets(mut self, strict: bool) -> Self {
        self.strict_targets = strict;
        self
    }

    /// Builder: set the root termination policy
    pub fn with_root_termination(mut self, policy: RootTerminationPolicy) -> Self {
        self.root_termination = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_transient_steps, 0);
        assert!(!config.strict_targets);
        assert_eq!(config.root_termination, RootTerminationPolicy::Error);
    }

    #[test]
    fn test_lookup_overrides() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("CSM_MAX_TRANSIENT_STEPS", "25"),
            ("CSM_STRICT_TARGETS", "TRUE"),
            ("CSM_ROOT_TERMINATION", "ignore"),
        ]));
        assert_eq!(config.max_transient_steps, 25);
        assert!(config.strict_targets);
        assert_eq!(config.root_termination, RootTerminationPolicy::Ignore);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("CSM_MAX_TRANSIENT_STEPS", "lots"),
            ("CSM_STRICT_TARGETS", "maybe"),
            ("CSM_ROOT_TERMINATION", "explode"),
        ]));
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_from_yaml() {
        let config = AgentConfig::from_yaml_str("max_transient_steps: 5\nroot_termination: ignore\n").unwrap();
        assert_eq!(config.max_transient_steps, 5);
        assert!(!config.strict_targets);
        assert_eq!(config.root_termination, RootTerminationPolicy::Ignore);

        assert!(matches!(
            AgentConfig::from_yaml_str("root_termination: sometimes"),
            Err(CoreError::ConfigurationError(_))
        ));
    }
}
