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

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

const SERVICE_NAME: &str = "weaver";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn current_log_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

/// Characters a field value may contain without quoting. Anything outside
/// this set forces the quoted form so `key=value` pairs stay splittable on
/// spaces.
fn is_plain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '+')
}

fn append_field(line: &mut String, key: &str, value: &str) {
    if !line.is_empty() {
        line.push(' ');
    }
    line.push_str(key);
    line.push('=');

    if !value.is_empty() && value.chars().all(is_plain_char) {
        line.push_str(value);
        return;
    }

    line.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                line.push('\\');
                line.push(c);
            }
            '\n' => line.push_str("\\n"),
            '\r' => line.push_str("\\r"),
            '\t' => line.push_str("\\t"),
            c => line.push(c),
        }
    }
    line.push('"');
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    if level < current_log_level() {
        return;
    }
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    let line = match current_log_format() {
        LogFormat::Text => {
            let mut line = String::new();
            append_field(&mut line, "ts", &timestamp);
            append_field(&mut line, "level", level.as_str());
            append_field(&mut line, "service", SERVICE_NAME);
            append_field(&mut line, "component", component);
            append_field(&mut line, "msg", message);
            for (key, value) in metadata {
                append_field(&mut line, key, value);
            }
            line
        }
        LogFormat::Json => {
            let mut object = serde_json::Map::new();
            object.insert("ts".to_string(), Value::String(timestamp));
            object.insert(
                "level".to_string(),
                Value::String(level.as_str().to_string()),
            );
            object.insert(
                "service".to_string(),
                Value::String(SERVICE_NAME.to_string()),
            );
            object.insert(
                "component".to_string(),
                Value::String(component.to_string()),
            );
            object.insert("msg".to_string(), Value::String(message.to_string()));
            for (key, value) in metadata {
                object.insert(key.to_string(), Value::String(value.to_string()));
            }
            Value::Object(object).to_string()
        }
    };

    write_line(level, &line);
}

fn write_line(level: LogLevel, line: &str) {
    let written = if level.is_stderr() {
        writeln!(io::stderr(), "{line}")
    } else {
        writeln!(io::stdout(), "{line}")
    };
    if let Err(err) = written {
        // Last resort: the log line must not vanish silently.
        let _ = writeln!(
            io::stderr(),
            "weaver: failed to write log line: {err} (original: {line})"
        );
    }
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}
