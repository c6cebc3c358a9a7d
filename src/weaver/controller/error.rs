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

use crate::weaver::controller::references::ReferenceError;
use crate::weaver::k8s::client::ApiError;
use crate::weaver::k8s::dynamic::DynamicError;
use crate::weaver::util::graph::GraphError;
use std::error::Error;
use std::fmt;

/// Error raised while processing one reconciliation pass.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Two resources in the Bundle share a name.
    DuplicateResource(String),
    /// The dependency graph could not be built or sorted.
    Graph(GraphError),
    /// A reference expression could not be resolved.
    Reference(ReferenceError),
    /// A resource specification is not a well-formed object.
    Dynamic(DynamicError),
    /// An existing object is controlled by something other than the Bundle.
    ForeignController { object: String },
    /// The object is already marked for deletion.
    BeingDeleted { object: String },
    /// The object exists but is not owned by the Bundle.
    NotOwned { object: String },
    /// The readiness checker failed.
    ReadyCheck { message: String },
    /// A write raced with another actor; the next event re-converges.
    Conflict { message: String },
    /// The API returned an unexpected error.
    Api(ApiError),
    /// The pass was cancelled by the caller.
    Cancelled,
}

impl SyncError {
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Conflict { .. } => true,
            SyncError::Api(err) => err.is_conflict(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::DuplicateResource(name) => {
                write!(f, "bundle contains two resources with the same name {name:?}")
            }
            SyncError::Graph(err) => err.fmt(f),
            SyncError::Reference(err) => err.fmt(f),
            SyncError::Dynamic(err) => err.fmt(f),
            SyncError::ForeignController { object } => write!(
                f,
                "object {object} carries a controller owner reference to a different owner"
            ),
            SyncError::BeingDeleted { object } => {
                write!(f, "object {object} is marked for deletion")
            }
            SyncError::NotOwned { object } => {
                write!(f, "object {object} is not owned by the Bundle")
            }
            SyncError::ReadyCheck { message } => {
                write!(f, "readiness check failed: {message}")
            }
            SyncError::Conflict { message } => message.fmt(f),
            SyncError::Api(err) => err.fmt(f),
            SyncError::Cancelled => write!(f, "reconciliation pass was cancelled"),
        }
    }
}

impl Error for SyncError {}

impl From<GraphError> for SyncError {
    fn from(err: GraphError) -> Self {
        SyncError::Graph(err)
    }
}

impl From<ReferenceError> for SyncError {
    fn from(err: ReferenceError) -> Self {
        SyncError::Reference(err)
    }
}

impl From<DynamicError> for SyncError {
    fn from(err: DynamicError) -> Self {
        SyncError::Dynamic(err)
    }
}

/// A failed pass, carrying whether a retry is expected to help.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub retriable: bool,
    pub error: SyncError,
}

impl SyncFailure {
    pub fn terminal(error: impl Into<SyncError>) -> Self {
        Self {
            retriable: false,
            error: error.into(),
        }
    }

    pub fn retriable(error: impl Into<SyncError>) -> Self {
        Self {
            retriable: true,
            error: error.into(),
        }
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl Error for SyncFailure {}
