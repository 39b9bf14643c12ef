//! Startup validation of proxy settings.
//!
//! Errors stop the proxy from starting; warnings and suggestions are only
//! logged.

use crate::config::ProxySettings;
use std::time::Duration;

const MIN_HEADER_SIZE: usize = 1024;
const MAX_HEADER_SIZE: usize = 1024 * 1024;
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }

    /// Logs warnings and suggestions, and returns all errors joined together.
    pub fn report(&self) -> Result<(), String> {
        for warning in &self.warnings {
            log::warn!("Configuration: {}", warning);
        }
        for suggestion in &self.suggestions {
            log::info!("Suggestion: {}", suggestion);
        }
        if self.is_valid {
            Ok(())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

pub struct ConfigValidator<'a> {
    settings: &'a ProxySettings,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(settings: &'a ProxySettings) -> Self {
        Self { settings }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_listen_address(&mut result);
        self.validate_limits(&mut result);
        self.validate_tunnel(&mut result);

        result
    }

    fn validate_listen_address(&self, result: &mut ValidationResult) {
        let addr = self.settings.listen_addr;

        if addr.port() == 0 {
            result.add_error("Listen port 0 is reserved".to_string());
        } else if addr.port() < 1024 {
            result.add_warning(format!(
                "Using privileged port {} - may require elevated privileges",
                addr.port()
            ));
        }

        if addr.ip().is_unspecified() {
            result.add_warning(format!(
                "Binding to all interfaces ({}) exposes the proxy to external networks",
                addr.ip()
            ));
            result.add_suggestion(
                "Bind the proxy to an internal interface unless remote clients need it".to_string(),
            );
        }
    }

    fn validate_limits(&self, result: &mut ValidationResult) {
        let settings = self.settings;

        if settings.max_connections == 0 {
            result.add_error("max_connections must be greater than 0".to_string());
        } else if settings.max_connections > 10_000 {
            result.add_warning(format!(
                "High connection limit ({}): every session holds two sockets",
                settings.max_connections
            ));
        }

        if settings.connect_timeout.is_zero() {
            result.add_error("connect_timeout_secs must be at least 1".to_string());
        } else if settings.connect_timeout > MAX_CONNECT_TIMEOUT {
            result.add_error(format!(
                "connect_timeout_secs ({}) exceeds {} seconds",
                settings.connect_timeout.as_secs(),
                MAX_CONNECT_TIMEOUT.as_secs()
            ));
        }

        if !(MIN_HEADER_SIZE..=MAX_HEADER_SIZE).contains(&settings.max_header_size) {
            result.add_error(format!(
                "max_header_size ({}) must be between {} and {} bytes",
                settings.max_header_size, MIN_HEADER_SIZE, MAX_HEADER_SIZE
            ));
        }
    }

    fn validate_tunnel(&self, result: &mut ValidationResult) {
        let settings = self.settings;

        if settings.tunnel_port == 0 {
            result.add_error("tunnel_port must not be 0".to_string());
        } else if settings.tunnel_port != 443 {
            result.add_warning(format!(
                "CONNECT tunnels will dial port {} instead of 443",
                settings.tunnel_port
            ));
        }

        let agent = settings.proxy_agent.trim();
        if agent.is_empty() {
            result.add_error("proxy_agent must not be empty".to_string());
        } else if settings.proxy_agent.contains(['\r', '\n']) {
            result.add_error("proxy_agent must not contain line breaks".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = ProxySettings::default();
        let result = ConfigValidator::new(&settings).validate();
        assert!(result.is_valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
        assert!(result.report().is_ok());
    }

    #[test]
    fn test_invalid_settings_are_reported() {
        let settings = ProxySettings {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 0,
            connect_timeout: Duration::ZERO,
            max_header_size: 10,
            proxy_agent: "Evil\r\nSet-Cookie: x".to_string(),
            tunnel_port: 0,
        };
        let result = ConfigValidator::new(&settings).validate();
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 6);
        assert!(result.report().is_err());
    }

    #[test]
    fn test_warnings_do_not_fail_validation() {
        let settings = ProxySettings {
            listen_addr: "0.0.0.0:80".parse().unwrap(),
            tunnel_port: 8443,
            ..ProxySettings::default()
        };
        let result = ConfigValidator::new(&settings).validate();
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 3);
        assert_eq!(result.suggestions.len(), 1);
    }
}
