use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Policy for automatic relaunch after a crash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestartConfig {
    /// Number of automatic relaunches allowed before giving up (0 disables restart)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before each relaunch attempt (in milliseconds)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Grow the delay exponentially instead of keeping it fixed
    #[serde(default)]
    pub use_exponential_backoff: bool,

    /// Cap for the exponential delay (in milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Randomize delays to spread out relaunches of sibling supervisors
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            backoff_ms: default_backoff_ms(),
            use_exponential_backoff: false,
            max_backoff_ms: default_max_backoff_ms(),
            jitter: false,
        }
    }
}

impl RestartConfig {
    /// No automatic relaunch at all
    pub fn disabled() -> Self {
        Self {
            max_restarts: 0,
            ..Default::default()
        }
    }

    /// Fixed-interval relaunch with the given budget
    pub fn fixed(max_restarts: u32, backoff: Duration) -> Self {
        Self {
            max_restarts,
            backoff_ms: backoff.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.use_exponential_backoff && self.backoff_ms > self.max_backoff_ms {
            return Err(anyhow::anyhow!(
                "backoff_ms cannot be greater than max_backoff_ms"
            ));
        }

        if self.max_restarts > 100 {
            return Err(anyhow::anyhow!(
                "max_restarts should not exceed 100 to avoid restart storms"
            ));
        }

        if self.max_backoff_ms > 300_000 {
            return Err(anyhow::anyhow!("max_backoff_ms should not exceed 5 minutes"));
        }

        Ok(())
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay sequence for successive relaunch attempts.
    ///
    /// Yields one delay per permitted restart. Callers bound the number of
    /// attempts with the crash count, so exhausting the iterator is treated
    /// as "use the last delay" rather than as a stop signal.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let times = self.max_restarts.max(1) as usize;
        if self.use_exponential_backoff {
            let mut builder = ExponentialBuilder::default()
                .with_min_delay(self.backoff())
                .with_max_delay(self.max_backoff())
                .with_max_times(times);
            if self.jitter {
                builder = builder.with_jitter();
            }
            Box::new(builder.build())
        } else {
            let mut builder = ConstantBuilder::default()
                .with_delay(self.backoff())
                .with_max_times(times);
            if self.jitter {
                builder = builder.with_jitter();
            }
            Box::new(builder.build())
        }
    }
}

/// How a freshly launched child announces that it can service requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReadinessStrategy {
    /// The child sends a protocol notification (`{"method": <method>}`) once ready
    Notification { method: String },
    /// A stdout/stderr log line containing `marker` signals readiness
    LogMarker { marker: String },
    /// Readiness is a successful response to `method`
    Probe {
        method: String,
        #[serde(default)]
        params: Option<Value>,
    },
    /// The child never signals; it is assumed ready once the startup timeout
    /// elapses with the process still alive
    #[default]
    Implicit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    #[serde(default)]
    pub strategy: ReadinessStrategy,

    /// Upper bound on the wait for readiness (in milliseconds)
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Declare readiness when the timeout elapses and the process is still
    /// alive, even though no signal arrived
    #[serde(default = "default_assume_ready_on_timeout")]
    pub assume_ready_on_timeout: bool,

    /// Interval between probe calls (Probe strategy only)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Per-probe response timeout (Probe strategy only)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            strategy: ReadinessStrategy::default(),
            startup_timeout_ms: default_startup_timeout_ms(),
            assume_ready_on_timeout: default_assume_ready_on_timeout(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ReadinessConfig {
    pub fn new(strategy: ReadinessStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn strict(mut self) -> Self {
        self.assume_ready_on_timeout = false;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.startup_timeout_ms == 0 {
            return Err(anyhow::anyhow!("startup_timeout_ms must be greater than zero"));
        }
        if let ReadinessStrategy::Probe { .. } = self.strategy {
            if self.probe_interval_ms == 0 || self.probe_timeout_ms == 0 {
                return Err(anyhow::anyhow!(
                    "probe_interval_ms and probe_timeout_ms must be greater than zero"
                ));
            }
        }
        if matches!(self.strategy, ReadinessStrategy::Implicit) && !self.assume_ready_on_timeout {
            return Err(anyhow::anyhow!(
                "Implicit readiness requires assume_ready_on_timeout"
            ));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Everything needed to start the child process.
///
/// Retained by the supervisor after a successful `launch` so a crashed child
/// can be relaunched with the same configuration.
#[derive(Default, Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct LaunchSpec {
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn builder() -> LaunchSpecBuilder {
        LaunchSpecBuilder::default()
    }

    /// Rendering used in logs and error messages
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// Replace every occurrence of `placeholder` in args and env values
    pub fn substitute(&self, placeholder: &str, value: &str) -> LaunchSpec {
        LaunchSpec {
            command: self.command.replace(placeholder, value),
            args: self
                .args
                .iter()
                .map(|arg| arg.replace(placeholder, value))
                .collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.replace(placeholder, value)))
                .collect(),
            working_directory: self.working_directory.clone(),
        }
    }
}

impl LaunchSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

/// Supervisor-wide settings
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into))]
pub struct SupervisorConfig {
    /// Name used in log output
    #[builder(default = "String::from(\"rpcvisor\")")]
    pub name: String,
    /// Value of the `version` field on outgoing requests
    #[builder(default = "default_protocol_version()")]
    pub protocol_version: String,
    #[builder(default = "default_call_timeout_ms()")]
    pub default_call_timeout_ms: u64,
    /// How long `stop` waits after SIGTERM before force-killing
    #[builder(default = "default_stop_grace_ms()")]
    pub stop_grace_ms: u64,
    /// Number of captured output lines kept in memory
    #[builder(default = "default_log_capacity()")]
    pub log_capacity: usize,
    #[builder(default)]
    pub readiness: ReadinessConfig,
    #[builder(default)]
    pub restart: RestartConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: String::from("rpcvisor"),
            protocol_version: default_protocol_version(),
            default_call_timeout_ms: default_call_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            log_capacity: default_log_capacity(),
            readiness: ReadinessConfig::default(),
            restart: RestartConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.readiness.validate()?;
        self.restart.validate()?;
        if self.default_call_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "default_call_timeout_ms must be greater than zero"
            ));
        }
        if self.log_capacity == 0 {
            return Err(anyhow::anyhow!("log_capacity must be greater than zero"));
        }
        Ok(())
    }

    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

// Default value functions for serde and the builders
fn default_max_restarts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_startup_timeout_ms() -> u64 {
    10_000
}
fn default_assume_ready_on_timeout() -> bool {
    true
}
fn default_probe_interval_ms() -> u64 {
    250
}
fn default_probe_timeout_ms() -> u64 {
    1_000
}
fn default_protocol_version() -> String {
    String::from("1.0")
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_stop_grace_ms() -> u64 {
    3_000
}
fn default_log_capacity() -> usize {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_restart_config() {
        let config = RestartConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_restarts, 3);
        assert_eq!(config.backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_delays_repeat() {
        let config = RestartConfig::fixed(3, Duration::from_millis(20));
        let delays: Vec<_> = config.delays().collect();
        assert_eq!(delays, vec![Duration::from_millis(20); 3]);
    }

    #[test]
    fn test_exponential_delays_grow() {
        let config = RestartConfig {
            max_restarts: 3,
            backoff_ms: 10,
            use_exponential_backoff: true,
            max_backoff_ms: 1_000,
            jitter: false,
        };
        let delays: Vec<_> = config.delays().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays[0] < delays[1]);
        assert!(delays[1] < delays[2]);
    }

    #[test]
    fn test_invalid_restart_config() {
        let config = RestartConfig {
            use_exponential_backoff: true,
            backoff_ms: 5_000,
            max_backoff_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_readiness_deserialization() {
        let json = r#"{"strategy":{"kind":"notification","method":"ready"},"startupTimeoutMs":500}"#;
        let config: ReadinessConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.strategy,
            ReadinessStrategy::Notification {
                method: "ready".to_string()
            }
        );
        assert_eq!(config.startup_timeout(), Duration::from_millis(500));
        assert!(config.assume_ready_on_timeout);
    }

    #[test]
    fn test_implicit_readiness_must_assume() {
        let config = ReadinessConfig::new(ReadinessStrategy::Implicit).strict();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::builder()
            .command("companion")
            .args(["--stdio", "--port={port}"])
            .env("PORT", "{port}")
            .working_directory("/tmp")
            .build()
            .unwrap();

        assert_eq!(spec.display_command(), "companion --stdio --port={port}");
        let resolved = spec.substitute("{port}", "8100");
        assert_eq!(resolved.args[1], "--port=8100");
        assert_eq!(resolved.env["PORT"], "8100");
        assert_eq!(resolved.working_directory, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_supervisor_config_builder_defaults() {
        let config = SupervisorConfig::builder()
            .name("companion")
            .build()
            .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol_version, "1.0");
        assert_eq!(config.default_call_timeout(), Duration::from_secs(30));
        assert_eq!(config.restart, RestartConfig::default());
    }
}
