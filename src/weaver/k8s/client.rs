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

use crate::weaver::api::types::Bundle;
use crate::weaver::k8s::dynamic::{DynamicObject, GroupVersionKind};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Classification of API responses the reconciler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// The requested object does not exist.
    NotFound,
    /// A create collided with an existing object.
    AlreadyExists,
    /// A write collided with a concurrent modification or a failed
    /// precondition.
    Conflict,
    /// The request payload was rejected by the server.
    Invalid,
    /// The server failed to process an otherwise valid request.
    Server,
    /// The request never produced a usable response.
    Transport,
}

impl ApiErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ApiErrorKind::NotFound => "not found",
            ApiErrorKind::AlreadyExists => "already exists",
            ApiErrorKind::Conflict => "conflict",
            ApiErrorKind::Invalid => "invalid",
            ApiErrorKind::Server => "server error",
            ApiErrorKind::Transport => "transport error",
        }
    }
}

/// Error returned by object store and API client operations.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::AlreadyExists, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Conflict, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Invalid, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Server, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Transport, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == ApiErrorKind::AlreadyExists
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ApiErrorKind::Conflict
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl Error for ApiError {}

/// Deletion propagation policy forwarded to the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletionPropagation {
    /// Dependents are deleted before the object is fully removed.
    Foreground,
    /// The object is removed immediately; dependents are cleaned up after.
    #[default]
    Background,
    /// Dependents are orphaned and left untouched.
    Orphan,
}

impl DeletionPropagation {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionPropagation::Foreground => "Foreground",
            DeletionPropagation::Background => "Background",
            DeletionPropagation::Orphan => "Orphan",
        }
    }
}

/// Options attached to a delete request.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// When set, the delete fails with a conflict unless the live object
    /// still carries this UID.
    pub uid_precondition: Option<String>,
    pub propagation: DeletionPropagation,
}

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Read-only view of the locally cached cluster state.
///
/// The cache is populated by the watch layer and shared across sync tasks;
/// reads are safe to issue concurrently.
pub trait ObjectStore: Send + Sync {
    fn get<'a>(
        &'a self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> ApiFuture<'a, Option<DynamicObject>>;

    /// Lists objects labelled as belonging to the named Bundle.
    fn list_for_bundle<'a>(
        &'a self,
        namespace: &str,
        bundle_name: &str,
    ) -> ApiFuture<'a, Vec<DynamicObject>>;
}

/// Write access to one resource collection, produced by [`SmartClient`].
pub trait ResourceClient: Send + Sync {
    fn create<'a>(&'a self, object: &DynamicObject) -> ApiFuture<'a, DynamicObject>;

    fn update<'a>(&'a self, object: &DynamicObject) -> ApiFuture<'a, DynamicObject>;

    fn delete<'a>(&'a self, name: &str, options: DeleteOptions) -> ApiFuture<'a, ()>;
}

/// Resolves a `(gvk, namespace)` pair to a resource client.
pub trait SmartClient: Send + Sync {
    fn for_gvk(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<Arc<dyn ResourceClient>, ApiError>;
}

/// Access to the Bundle collection itself.
pub trait BundleClient: Send + Sync {
    fn get<'a>(&'a self, namespace: &str, name: &str) -> ApiFuture<'a, Option<Bundle>>;

    fn list<'a>(&'a self, namespace: &str) -> ApiFuture<'a, Vec<Bundle>>;

    /// Writes the Bundle back, carrying its updated status.
    fn update<'a>(&'a self, bundle: &Bundle) -> ApiFuture<'a, Bundle>;
}
