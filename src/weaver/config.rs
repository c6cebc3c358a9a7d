/*
 * Copyright (C) 2025 The Weaver Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::weaver::logger::log_warn;
use std::env;
use std::time::Duration;

const COMPONENT: &str = "config";

/// Enum for supported configuration parameters.
#[derive(Debug, Clone, Copy)]
pub enum Config {
    /// Base URL of the API server the controller reconciles against.
    Server,
    /// Namespace the controller watches; empty means all namespaces.
    Namespace,
    /// Size of the reconciliation worker pool.
    Workers,
    /// Interval at which all Bundles are re-enqueued.
    ResyncInterval,
    /// Log output format, `text` or `json`.
    LogFormat,
    /// Listen address for the metrics and health endpoints.
    MetricsAddr,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Server => "WEAVER_SERVER",
            Config::Namespace => "WEAVER_NAMESPACE",
            Config::Workers => "WEAVER_WORKERS",
            Config::ResyncInterval => "WEAVER_RESYNC_INTERVAL",
            Config::LogFormat => "WEAVER_LOG_FORMAT",
            Config::MetricsAddr => "WEAVER_METRICS_ADDR",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Server => "https://127.0.0.1:6443",
            Config::Namespace => "default",
            Config::Workers => "4",
            Config::ResyncInterval => "5m",
            Config::LogFormat => "text",
            Config::MetricsAddr => "127.0.0.1:9402",
        }
    }

    /// Resolves the parameter from the environment, falling back to the
    /// built-in default.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    pub fn get_usize(&self) -> usize {
        let raw = self.get();
        match raw.parse::<usize>() {
            Ok(value) if value > 0 => value,
            _ => {
                log_warn(
                    COMPONENT,
                    "Invalid numeric configuration value, using default",
                    &[("var", self.env_var()), ("value", raw.as_str())],
                );
                self.default_value()
                    .parse()
                    .expect("built-in default parses")
            }
        }
    }

    pub fn get_duration(&self) -> Duration {
        let raw = self.get();
        match humantime::parse_duration(&raw) {
            Ok(value) => value,
            Err(_) => {
                log_warn(
                    COMPONENT,
                    "Invalid duration configuration value, using default",
                    &[("var", self.env_var()), ("value", raw.as_str())],
                );
                humantime::parse_duration(self.default_value())
                    .expect("built-in default parses")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_well_formed() {
        assert!(Config::Workers.default_value().parse::<usize>().is_ok());
        assert!(humantime::parse_duration(Config::ResyncInterval.default_value()).is_ok());
        assert!(Config::Server.default_value().starts_with("https://"));
    }
}
