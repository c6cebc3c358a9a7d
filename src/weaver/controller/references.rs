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

//! Reference evaluation over resource specifications.
//!
//! A specification may embed expressions of the form `{{peer:path}}` where
//! `peer` names another resource in the same Bundle and `path` points into
//! that peer's observed object. A string that is exactly one expression is
//! replaced by the referenced value verbatim; expressions inside a longer
//! string substitute the value's text form and require a scalar. References
//! are one level deep: the substituted value is never re-evaluated.

use crate::weaver::k8s::dynamic::DynamicObject;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Errors produced while resolving reference expressions. All of them are
/// structural: the Bundle must change for a retry to succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    Malformed { expression: String },
    UndeclaredDependency { resource: String, peer: String },
    PeerNotReady { peer: String },
    UnresolvedPath { peer: String, path: String },
    NonScalar { peer: String, path: String },
}

impl fmt::Display for ReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceError::Malformed { expression } => {
                write!(f, "malformed reference expression {expression:?}")
            }
            ReferenceError::UndeclaredDependency { resource, peer } => write!(
                f,
                "resource {resource:?} references {peer:?} which is not listed in its dependencies"
            ),
            ReferenceError::PeerNotReady { peer } => {
                write!(f, "referenced resource {peer:?} has no ready object")
            }
            ReferenceError::UnresolvedPath { peer, path } => {
                write!(f, "path {path:?} does not resolve in resource {peer:?}")
            }
            ReferenceError::NonScalar { peer, path } => write!(
                f,
                "path {path:?} in resource {peer:?} is not a scalar and cannot be embedded in a string"
            ),
        }
    }
}

impl Error for ReferenceError {}

/// Resolves reference expressions for one resource against its ready peers.
pub struct ReferenceResolver<'a> {
    resource: &'a str,
    ready: &'a HashMap<String, DynamicObject>,
    depends_on: &'a [String],
}

struct Expression<'a> {
    peer: &'a str,
    path: &'a str,
    /// Byte range of the full `{{…}}` token within the enclosing string.
    start: usize,
    end: usize,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(
        resource: &'a str,
        ready: &'a HashMap<String, DynamicObject>,
        depends_on: &'a [String],
    ) -> Self {
        Self {
            resource,
            ready,
            depends_on,
        }
    }

    /// Rewrites every reference expression in `value` in place.
    pub fn process(&self, value: &mut Value) -> Result<(), ReferenceError> {
        match value {
            Value::Object(map) => {
                for entry in map.values_mut() {
                    self.process(entry)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.process(item)?;
                }
                Ok(())
            }
            Value::String(text) => {
                if let Some(replacement) = self.resolve_string(text)? {
                    *value = replacement;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn resolve_string(&self, text: &str) -> Result<Option<Value>, ReferenceError> {
        let expressions = parse_expressions(text)?;
        if expressions.is_empty() {
            return Ok(None);
        }

        // A string that is exactly one expression takes the referenced value
        // verbatim, whatever its type.
        if expressions.len() == 1 {
            let expression = &expressions[0];
            if expression.start == 0 && expression.end == text.len() {
                return Ok(Some(self.lookup(expression)?.clone()));
            }
        }

        let mut rendered = String::with_capacity(text.len());
        let mut cursor = 0;
        for expression in &expressions {
            rendered.push_str(&text[cursor..expression.start]);
            let value = self.lookup(expression)?;
            match value {
                Value::String(s) => rendered.push_str(s),
                Value::Number(n) => rendered.push_str(&n.to_string()),
                Value::Bool(b) => rendered.push_str(if *b { "true" } else { "false" }),
                _ => {
                    return Err(ReferenceError::NonScalar {
                        peer: expression.peer.to_string(),
                        path: expression.path.to_string(),
                    })
                }
            }
            cursor = expression.end;
        }
        rendered.push_str(&text[cursor..]);
        Ok(Some(Value::String(rendered)))
    }

    fn lookup(&self, expression: &Expression<'_>) -> Result<&Value, ReferenceError> {
        let peer = expression.peer;
        if !self.depends_on.iter().any(|dep| dep == peer) {
            return Err(ReferenceError::UndeclaredDependency {
                resource: self.resource.to_string(),
                peer: peer.to_string(),
            });
        }
        let object = self.ready.get(peer).ok_or_else(|| ReferenceError::PeerNotReady {
            peer: peer.to_string(),
        })?;
        object
            .path(expression.path)
            .ok_or_else(|| ReferenceError::UnresolvedPath {
                peer: peer.to_string(),
                path: expression.path.to_string(),
            })
    }
}

fn parse_expressions(text: &str) -> Result<Vec<Expression<'_>>, ReferenceError> {
    let mut expressions = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find(OPEN) {
        let start = cursor + offset;
        let body_start = start + OPEN.len();
        let Some(close_offset) = text[body_start..].find(CLOSE) else {
            return Err(ReferenceError::Malformed {
                expression: text[start..].to_string(),
            });
        };
        let body_end = body_start + close_offset;
        let end = body_end + CLOSE.len();
        let body = &text[body_start..body_end];
        let Some((peer, path)) = body.split_once(':') else {
            return Err(ReferenceError::Malformed {
                expression: text[start..end].to_string(),
            });
        };
        let peer = peer.trim();
        let path = path.trim();
        if peer.is_empty() || path.is_empty() {
            return Err(ReferenceError::Malformed {
                expression: text[start..end].to_string(),
            });
        }
        expressions.push(Expression {
            peer,
            path,
            start,
            end,
        });
        cursor = end;
    }
    Ok(expressions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ready_peer(name: &str, object: Value) -> HashMap<String, DynamicObject> {
        let mut ready = HashMap::new();
        ready.insert(
            name.to_string(),
            DynamicObject::from_value(object).expect("peer object"),
        );
        ready
    }

    fn db_peer() -> HashMap<String, DynamicObject> {
        ready_peer(
            "db",
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "db"},
                "status": {"host": "db.internal", "port": 5432, "endpoints": ["a", "b"]}
            }),
        )
    }

    #[test]
    fn whole_string_expression_substitutes_verbatim() {
        let ready = db_peer();
        let deps = vec!["db".to_string()];
        let resolver = ReferenceResolver::new("app", &ready, &deps);
        let mut spec = json!({"port": "{{db:status/port}}", "hosts": "{{db:status/endpoints}}"});
        resolver.process(&mut spec).expect("references resolve");
        assert_eq!(spec, json!({"port": 5432, "hosts": ["a", "b"]}));
    }

    #[test]
    fn embedded_expressions_render_scalars() {
        let ready = db_peer();
        let deps = vec!["db".to_string()];
        let resolver = ReferenceResolver::new("app", &ready, &deps);
        let mut spec = json!({"url": "postgres://{{db:status/host}}:{{db:status/port}}/shop"});
        resolver.process(&mut spec).expect("references resolve");
        assert_eq!(spec, json!({"url": "postgres://db.internal:5432/shop"}));
    }

    #[test]
    fn embedded_non_scalar_is_rejected() {
        let ready = db_peer();
        let deps = vec!["db".to_string()];
        let resolver = ReferenceResolver::new("app", &ready, &deps);
        let mut spec = json!({"hosts": "list: {{db:status/endpoints}}"});
        let err = resolver.process(&mut spec).unwrap_err();
        assert_eq!(
            err,
            ReferenceError::NonScalar {
                peer: "db".to_string(),
                path: "status/endpoints".to_string(),
            }
        );
    }

    #[test]
    fn reference_outside_depends_on_fails() {
        let ready = db_peer();
        let deps: Vec<String> = Vec::new();
        let resolver = ReferenceResolver::new("app", &ready, &deps);
        let mut spec = json!({"host": "{{db:status/host}}"});
        let err = resolver.process(&mut spec).unwrap_err();
        assert_eq!(
            err,
            ReferenceError::UndeclaredDependency {
                resource: "app".to_string(),
                peer: "db".to_string(),
            }
        );
    }

    #[test]
    fn unresolved_path_fails() {
        let ready = db_peer();
        let deps = vec!["db".to_string()];
        let resolver = ReferenceResolver::new("app", &ready, &deps);
        let mut spec = json!({"host": "{{db:status/address}}"});
        let err = resolver.process(&mut spec).unwrap_err();
        assert_eq!(
            err,
            ReferenceError::UnresolvedPath {
                peer: "db".to_string(),
                path: "status/address".to_string(),
            }
        );
    }

    #[test]
    fn substituted_values_are_not_re_evaluated() {
        let ready = ready_peer(
            "cfg",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cfg"},
                "data": {"inner": "{{cfg:data/other}}", "other": "final"}
            }),
        );
        let deps = vec!["cfg".to_string()];
        let resolver = ReferenceResolver::new("app", &ready, &deps);
        let mut spec = json!({"value": "{{cfg:data/inner}}"});
        resolver.process(&mut spec).expect("reference resolves");
        // The referenced string itself contains an expression; it must be
        // copied through untouched.
        assert_eq!(spec, json!({"value": "{{cfg:data/other}}"}));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        let ready = db_peer();
        let deps = vec!["db".to_string()];
        let resolver = ReferenceResolver::new("app", &ready, &deps);
        for bad in ["{{db}}", "{{db:}}", "{{:path}}", "prefix {{db:status/host"] {
            let mut spec = json!({ "value": bad });
            assert!(
                resolver.process(&mut spec).is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }
}
