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

//! Polymorphic readiness checks.
//!
//! Readiness means something different per resource kind: a Deployment is
//! ready when its replicas are, a custom resource may publish a status
//! field. Checkers are registered per `(group, kind)`; anything without a
//! registered checker is considered ready as soon as it has been applied.

use crate::weaver::k8s::dynamic::DynamicObject;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Failure of a readiness probe, carrying whether a retry may help.
#[derive(Debug, Clone)]
pub struct ReadyError {
    pub retriable: bool,
    pub message: String,
}

impl ReadyError {
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            message: message.into(),
        }
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            message: message.into(),
        }
    }
}

impl fmt::Display for ReadyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

impl Error for ReadyError {}

/// Predicate answering whether an observed object is in a terminal ready
/// state.
pub trait ReadyCheck: Send + Sync {
    fn is_ready(&self, object: &DynamicObject) -> Result<bool, ReadyError>;
}

impl<F> ReadyCheck for F
where
    F: Fn(&DynamicObject) -> Result<bool, ReadyError> + Send + Sync,
{
    fn is_ready(&self, object: &DynamicObject) -> Result<bool, ReadyError> {
        self(object)
    }
}

/// Fallback checker: an object without a specific checker is ready the
/// moment its apply succeeded.
pub struct AlwaysReady;

impl ReadyCheck for AlwaysReady {
    fn is_ready(&self, _object: &DynamicObject) -> Result<bool, ReadyError> {
        Ok(true)
    }
}

/// Ready when `status.conditions` carries the named condition with status
/// `"True"`.
pub struct ConditionReady {
    pub condition_type: String,
}

impl ReadyCheck for ConditionReady {
    fn is_ready(&self, object: &DynamicObject) -> Result<bool, ReadyError> {
        let Some(conditions) = object.path("status/conditions").and_then(Value::as_array) else {
            return Ok(false);
        };
        Ok(conditions.iter().any(|condition| {
            condition.get("type").and_then(Value::as_str) == Some(self.condition_type.as_str())
                && condition.get("status").and_then(Value::as_str) == Some("True")
        }))
    }
}

/// Ready when the value at `path` equals `expected`.
pub struct FieldReady {
    pub path: String,
    pub expected: String,
}

impl ReadyCheck for FieldReady {
    fn is_ready(&self, object: &DynamicObject) -> Result<bool, ReadyError> {
        Ok(object.path(&self.path).and_then(Value::as_str) == Some(self.expected.as_str()))
    }
}

/// Registry dispatching readiness checks by `(group, kind)`.
pub struct ReadyChecker {
    checks: HashMap<(String, String), Arc<dyn ReadyCheck>>,
    fallback: Arc<dyn ReadyCheck>,
}

impl Default for ReadyChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyChecker {
    pub fn new() -> Self {
        Self {
            checks: HashMap::new(),
            fallback: Arc::new(AlwaysReady),
        }
    }

    pub fn register(&mut self, group: &str, kind: &str, check: Arc<dyn ReadyCheck>) {
        self.checks
            .insert((group.to_string(), kind.to_string()), check);
    }

    pub fn is_ready(&self, object: &DynamicObject) -> Result<bool, ReadyError> {
        let gvk = object
            .gvk()
            .map_err(|err| ReadyError::terminal(err.to_string()))?;
        let check = self
            .checks
            .get(&gvk.group_kind())
            .unwrap_or(&self.fallback);
        check.is_ready(object)
    }
}
