//! Relay runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the services. Nothing
//! below `main` reads process-wide environment variables, which keeps request handling and tests
//! independent of the environment they happen to run in.

use crate::constants::{DEFAULT_POLL_INTERVAL, RECORDS_DIR_NAME};
use crate::{WorkflowError, WorkflowResult};
use relay_files::DEFAULT_SCRATCH_DIR_NAME;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which binding the workflow and document ingress forward through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ForwardMode {
    /// Mutual TLS TCP to `forward_to`.
    #[default]
    Tcp,
    /// HTTP POST to `http_sink_url`.
    Http,
}

impl FromStr for ForwardMode {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ForwardMode::Tcp),
            "http" => Ok(ForwardMode::Http),
            other => Err(WorkflowError::InvalidInput(format!(
                "unknown forward mode '{}' (expected 'tcp' or 'http')",
                other
            ))),
        }
    }
}

/// Network addresses the process listens on and talks to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    /// HTTP ingress listen address.
    pub http_bind: String,
    /// Local relay hop listen address; `None` disables the relay hop.
    pub relay_bind: Option<String>,
    /// Where the local relay hop forwards to.
    pub relay_next_hop: String,
    /// Local terminal hop listen address; `None` disables the terminal hop.
    pub terminal_bind: Option<String>,
    /// TCP hop the workflow and `/hl7/tcp` send to.
    pub forward_to: String,
    /// Name the TCP hops' certificates must be valid for.
    pub server_name: String,
    /// Third-party HTTP sink used by `/hl7/http` and by [`ForwardMode::Http`].
    pub http_sink_url: String,
}

/// Timeouts, limits and polling cadence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Interval between folder polls; `None` disables polling.
    pub poll_interval: Option<Duration>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// Relay configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    data_dir: PathBuf,
    cert_dir: PathBuf,
    endpoints: Endpoints,
    forward_mode: ForwardMode,
    timing: Timing,
}

impl RelayConfig {
    /// Create a new `RelayConfig`.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::InvalidInput` if a required address is empty, an address is not
    /// `host:port`, the HTTP sink URL is not `http(s)://`, a timeout is zero, or the frame limit
    /// is zero.
    pub fn new(
        data_dir: PathBuf,
        cert_dir: PathBuf,
        endpoints: Endpoints,
        forward_mode: ForwardMode,
        timing: Timing,
    ) -> WorkflowResult<Self> {
        require_host_port("http_bind", &endpoints.http_bind)?;
        require_host_port("forward_to", &endpoints.forward_to)?;
        if let Some(bind) = &endpoints.relay_bind {
            require_host_port("relay_bind", bind)?;
            require_host_port("relay_next_hop", &endpoints.relay_next_hop)?;
        }
        if let Some(bind) = &endpoints.terminal_bind {
            require_host_port("terminal_bind", bind)?;
        }
        if endpoints.server_name.trim().is_empty() {
            return Err(WorkflowError::InvalidInput(
                "server_name cannot be empty".into(),
            ));
        }
        if !(endpoints.http_sink_url.starts_with("http://")
            || endpoints.http_sink_url.starts_with("https://"))
        {
            return Err(WorkflowError::InvalidInput(format!(
                "http_sink_url must be an http(s) URL, got '{}'",
                endpoints.http_sink_url
            )));
        }
        if timing.connect_timeout.is_zero() || timing.read_timeout.is_zero() {
            return Err(WorkflowError::InvalidInput(
                "timeouts must be greater than zero".into(),
            ));
        }
        if timing.max_frame_bytes == 0 {
            return Err(WorkflowError::InvalidInput(
                "max_frame_bytes must be greater than zero".into(),
            ));
        }

        Ok(Self {
            data_dir,
            cert_dir,
            endpoints,
            forward_mode,
            timing,
        })
    }

    /// Root of the pipeline folders.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join(DEFAULT_SCRATCH_DIR_NAME)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join(RECORDS_DIR_NAME)
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn forward_mode(&self) -> ForwardMode {
        self.forward_mode
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }
}

fn require_host_port(name: &str, value: &str) -> WorkflowResult<()> {
    let valid = value
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.trim().is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(WorkflowError::InvalidInput(format!(
            "{} must be host:port, got '{}'",
            name, value
        )))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse the forward mode from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns [`ForwardMode::Tcp`].
pub fn forward_mode_from_env_value(value: Option<String>) -> WorkflowResult<ForwardMode> {
    Ok(non_empty(value)
        .map(|v| v.parse::<ForwardMode>())
        .transpose()?
        .unwrap_or_default())
}

/// Parse a duration from an optional string value.
///
/// Accepts whole seconds (`"30"`, `"30s"`) or milliseconds (`"500ms"`). If `value` is `None` or
/// empty/whitespace, returns `default`.
pub fn duration_from_env_value(
    value: Option<String>,
    default: Duration,
) -> WorkflowResult<Duration> {
    let Some(value) = non_empty(value) else {
        return Ok(default);
    };
    let invalid = || WorkflowError::InvalidInput(format!("invalid duration '{}'", value));

    if let Some(millis) = value.strip_suffix("ms") {
        return millis
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| invalid());
    }
    let secs = value.strip_suffix('s').unwrap_or(&value);
    secs.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| invalid())
}

/// Parse the poll interval. `"0"`, `"off"` and `"disabled"` turn polling off.
pub fn poll_interval_from_env_value(value: Option<String>) -> WorkflowResult<Option<Duration>> {
    match non_empty(value) {
        Some(v) if v == "off" || v == "disabled" => Ok(None),
        other => {
            let interval = duration_from_env_value(other, DEFAULT_POLL_INTERVAL)?;
            Ok((!interval.is_zero()).then_some(interval))
        }
    }
}

/// Parse a byte count from an optional string value, falling back to `default`.
pub fn bytes_from_env_value(value: Option<String>, default: usize) -> WorkflowResult<usize> {
    non_empty(value)
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| WorkflowError::InvalidInput(format!("invalid byte count '{}'", v)))
        })
        .transpose()
        .map(|v| v.unwrap_or(default))
}

/// Resolve an optional address: `None` or empty disables, anything else is kept.
pub fn optional_from_env_value(value: Option<String>) -> Option<String> {
    non_empty(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints {
            http_bind: "0.0.0.0:8080".into(),
            relay_bind: Some("0.0.0.0:8081".into()),
            relay_next_hop: "127.0.0.1:8082".into(),
            terminal_bind: None,
            forward_to: "127.0.0.1:8081".into(),
            server_name: "localhost".into(),
            http_sink_url: "http://localhost:9000/hl7".into(),
        }
    }

    fn timing() -> Timing {
        Timing {
            poll_interval: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            max_frame_bytes: 1024,
        }
    }

    fn config(endpoints: Endpoints, timing: Timing) -> WorkflowResult<RelayConfig> {
        RelayConfig::new(
            PathBuf::from("data"),
            PathBuf::from("keys"),
            endpoints,
            ForwardMode::Tcp,
            timing,
        )
    }

    #[test]
    fn test_valid_config_derives_directories() {
        let cfg = config(endpoints(), timing()).unwrap();
        assert_eq!(cfg.scratch_dir(), PathBuf::from("data/Scratch"));
        assert_eq!(cfg.records_dir(), PathBuf::from("data/Records"));
        assert_eq!(cfg.forward_mode(), ForwardMode::Tcp);
    }

    #[test]
    fn test_rejects_bad_addresses() {
        let mut e = endpoints();
        e.forward_to = "localhost".into();
        assert!(matches!(
            config(e, timing()),
            Err(WorkflowError::InvalidInput(_))
        ));

        let mut e = endpoints();
        e.http_sink_url = "ftp://sink".into();
        assert!(config(e, timing()).is_err());

        let mut e = endpoints();
        e.terminal_bind = Some("127.0.0.1:notaport".into());
        assert!(config(e, timing()).is_err());

        let mut e = endpoints();
        e.relay_bind = None;
        e.relay_next_hop = String::new();
        assert!(config(e, timing()).is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut t = timing();
        t.read_timeout = Duration::ZERO;
        assert!(config(endpoints(), t).is_err());

        let mut t = timing();
        t.max_frame_bytes = 0;
        assert!(config(endpoints(), t).is_err());
    }

    #[test]
    fn test_forward_mode_from_env_value() {
        assert_eq!(forward_mode_from_env_value(None).unwrap(), ForwardMode::Tcp);
        assert_eq!(
            forward_mode_from_env_value(Some("  ".into())).unwrap(),
            ForwardMode::Tcp
        );
        assert_eq!(
            forward_mode_from_env_value(Some("HTTP".into())).unwrap(),
            ForwardMode::Http
        );
        assert!(forward_mode_from_env_value(Some("smtp".into())).is_err());
    }

    #[test]
    fn test_duration_from_env_value() {
        let default = Duration::from_secs(7);
        assert_eq!(duration_from_env_value(None, default).unwrap(), default);
        assert_eq!(
            duration_from_env_value(Some("30".into()), default).unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            duration_from_env_value(Some("5s".into()), default).unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(
            duration_from_env_value(Some("250ms".into()), default).unwrap(),
            Duration::from_millis(250)
        );
        assert!(duration_from_env_value(Some("soon".into()), default).is_err());
    }

    #[test]
    fn test_poll_interval_can_be_disabled() {
        assert_eq!(
            poll_interval_from_env_value(None).unwrap(),
            Some(DEFAULT_POLL_INTERVAL)
        );
        assert_eq!(poll_interval_from_env_value(Some("0".into())).unwrap(), None);
        assert_eq!(poll_interval_from_env_value(Some("off".into())).unwrap(), None);
    }

    #[test]
    fn test_bytes_and_optional_values() {
        assert_eq!(bytes_from_env_value(None, 10).unwrap(), 10);
        assert_eq!(bytes_from_env_value(Some("2048".into()), 10).unwrap(), 2048);
        assert!(bytes_from_env_value(Some("-1".into()), 10).is_err());
        assert_eq!(optional_from_env_value(Some(" ".into())), None);
        assert_eq!(
            optional_from_env_value(Some("127.0.0.1:8082".into())),
            Some("127.0.0.1:8082".into())
        );
    }
}
