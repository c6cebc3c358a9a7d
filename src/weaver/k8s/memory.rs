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

//! In-memory cluster backend.
//!
//! Implements the object store, smart client and Bundle client against a
//! shared in-process map. Every API verb is recorded so tests can assert on
//! exactly which calls a reconciliation pass performed.

use crate::weaver::api::types::{Bundle, BUNDLE_NAME_LABEL};
use crate::weaver::k8s::client::{
    ApiError, ApiFuture, BundleClient, DeleteOptions, ObjectStore, ResourceClient, SmartClient,
};
use crate::weaver::k8s::dynamic::{DynamicObject, GroupVersionKind};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
    BundleUpdate,
}

/// One recorded API interaction.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub verb: Verb,
    pub gvk: GroupVersionKind,
    pub namespace: String,
    pub name: String,
    /// Options observed on delete calls.
    pub delete_options: Option<DeleteOptions>,
}

type ObjectKey = (GroupVersionKind, String, String);

#[derive(Default)]
struct State {
    objects: HashMap<ObjectKey, DynamicObject>,
    bundles: HashMap<(String, String), Bundle>,
    /// Objects present on the "server" but not yet surfaced by the store,
    /// simulating watch-cache lag.
    hidden_from_store: HashSet<ObjectKey>,
    /// Resource types for which client resolution fails.
    unresolvable: HashSet<GroupVersionKind>,
    queued_errors: Vec<(Verb, ApiError)>,
    calls: Vec<ApiCall>,
}

struct Inner {
    state: Mutex<State>,
    uid_counter: AtomicU64,
}

/// Shared in-memory cluster handle.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                uid_counter: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("memory cluster state poisoned")
    }

    fn next_uid(&self) -> String {
        let n = self.inner.uid_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("uid-{n}")
    }

    fn record(state: &mut State, verb: Verb, gvk: &GroupVersionKind, namespace: &str, name: &str) {
        state.calls.push(ApiCall {
            verb,
            gvk: gvk.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            delete_options: None,
        });
    }

    fn take_queued_error(state: &mut State, verb: Verb) -> Option<ApiError> {
        let position = state
            .queued_errors
            .iter()
            .position(|(queued, _)| *queued == verb)?;
        Some(state.queued_errors.remove(position).1)
    }

    /// Places an object directly on the server and in the store view.
    pub fn seed_object(&self, namespace: &str, object: DynamicObject) {
        let gvk = object.gvk().expect("seeded object has a gvk");
        let name = object.name().expect("seeded object has a name").to_string();
        self.lock()
            .objects
            .insert((gvk, namespace.to_string(), name), object);
    }

    /// Hides a server-side object from store reads, simulating a store that
    /// has not caught up with the server yet.
    pub fn hide_from_store(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) {
        self.lock().hidden_from_store.insert((
            gvk.clone(),
            namespace.to_string(),
            name.to_string(),
        ));
    }

    /// Makes client resolution fail for the given resource type.
    pub fn make_unresolvable(&self, gvk: &GroupVersionKind) {
        self.lock().unresolvable.insert(gvk.clone());
    }

    /// Queues an error returned by the next call with the given verb.
    pub fn queue_error(&self, verb: Verb, error: ApiError) {
        self.lock().queued_errors.push((verb, error));
    }

    pub fn put_bundle(&self, bundle: Bundle) {
        let key = (bundle.namespace().to_string(), bundle.name().to_string());
        self.lock().bundles.insert(key, bundle);
    }

    pub fn bundle(&self, namespace: &str, name: &str) -> Option<Bundle> {
        self.lock()
            .bundles
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn object(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Option<DynamicObject> {
        self.lock()
            .objects
            .get(&(gvk.clone(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.lock().calls.clone()
    }

    pub fn calls_with_verb(&self, verb: Verb) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.verb == verb)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn create_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let name = object
            .name()
            .ok_or_else(|| ApiError::invalid("object has no metadata.name"))?
            .to_string();
        let mut state = self.lock();
        Self::record(&mut state, Verb::Create, gvk, namespace, &name);
        if let Some(error) = Self::take_queued_error(&mut state, Verb::Create) {
            return Err(error);
        }
        let key = (gvk.clone(), namespace.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(ApiError::already_exists(format!(
                "{gvk} {name:?} already exists"
            )));
        }
        drop(state);
        let uid = self.next_uid();
        let mut stored = object.clone();
        stored.set_uid(&uid);
        stored.set_resource_version("1");
        self.lock().objects.insert(key, stored.clone());
        Ok(stored)
    }

    fn update_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let name = object
            .name()
            .ok_or_else(|| ApiError::invalid("object has no metadata.name"))?
            .to_string();
        let mut state = self.lock();
        Self::record(&mut state, Verb::Update, gvk, namespace, &name);
        if let Some(error) = Self::take_queued_error(&mut state, Verb::Update) {
            return Err(error);
        }
        let key = (gvk.clone(), namespace.to_string(), name.clone());
        let existing = state
            .objects
            .get(&key)
            .ok_or_else(|| ApiError::not_found(format!("{gvk} {name:?} not found")))?;
        if object.resource_version() != existing.resource_version() {
            return Err(ApiError::conflict(format!(
                "{gvk} {name:?} was modified concurrently"
            )));
        }
        let next_version = existing
            .resource_version()
            .and_then(|version| version.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let mut stored = object.clone();
        stored.set_resource_version(&next_version.to_string());
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    fn delete_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ApiError> {
        let mut state = self.lock();
        state.calls.push(ApiCall {
            verb: Verb::Delete,
            gvk: gvk.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            delete_options: Some(options.clone()),
        });
        if let Some(error) = Self::take_queued_error(&mut state, Verb::Delete) {
            return Err(error);
        }
        let key = (gvk.clone(), namespace.to_string(), name.to_string());
        let existing = state
            .objects
            .get(&key)
            .ok_or_else(|| ApiError::not_found(format!("{gvk} {name:?} not found")))?;
        if let Some(expected_uid) = options.uid_precondition.as_deref() {
            if existing.uid() != Some(expected_uid) {
                return Err(ApiError::conflict(format!(
                    "{gvk} {name:?} UID precondition failed"
                )));
            }
        }
        state.objects.remove(&key);
        state.hidden_from_store.remove(&(
            gvk.clone(),
            namespace.to_string(),
            name.to_string(),
        ));
        Ok(())
    }
}

impl ObjectStore for MemoryCluster {
    fn get<'a>(
        &'a self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> ApiFuture<'a, Option<DynamicObject>> {
        let key = (gvk.clone(), namespace.to_string(), name.to_string());
        Box::pin(async move {
            let state = self.lock();
            if state.hidden_from_store.contains(&key) {
                return Ok(None);
            }
            Ok(state.objects.get(&key).cloned())
        })
    }

    fn list_for_bundle<'a>(
        &'a self,
        namespace: &str,
        bundle_name: &str,
    ) -> ApiFuture<'a, Vec<DynamicObject>> {
        let namespace = namespace.to_string();
        let bundle_name = bundle_name.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = Self::take_queued_error(&mut state, Verb::List) {
                return Err(error);
            }
            let mut matches = Vec::new();
            for ((_, object_namespace, _), object) in state.objects.iter() {
                if object_namespace != &namespace {
                    continue;
                }
                if state
                    .hidden_from_store
                    .contains(&(object.gvk().expect("stored object has a gvk"),
                        object_namespace.clone(),
                        object.name().unwrap_or_default().to_string()))
                {
                    continue;
                }
                if object.labels().get(BUNDLE_NAME_LABEL) == Some(&bundle_name) {
                    matches.push(object.clone());
                }
            }
            Ok(matches)
        })
    }
}

struct MemoryResourceClient {
    cluster: MemoryCluster,
    gvk: GroupVersionKind,
    namespace: String,
}

impl ResourceClient for MemoryResourceClient {
    fn create<'a>(&'a self, object: &DynamicObject) -> ApiFuture<'a, DynamicObject> {
        let object = object.clone();
        Box::pin(async move { self.cluster.create_object(&self.gvk, &self.namespace, &object) })
    }

    fn update<'a>(&'a self, object: &DynamicObject) -> ApiFuture<'a, DynamicObject> {
        let object = object.clone();
        Box::pin(async move { self.cluster.update_object(&self.gvk, &self.namespace, &object) })
    }

    fn delete<'a>(&'a self, name: &str, options: DeleteOptions) -> ApiFuture<'a, ()> {
        let name = name.to_string();
        Box::pin(async move {
            self.cluster
                .delete_object(&self.gvk, &self.namespace, &name, &options)
        })
    }
}

impl SmartClient for MemoryCluster {
    fn for_gvk(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<Arc<dyn ResourceClient>, ApiError> {
        if self.lock().unresolvable.contains(gvk) {
            return Err(ApiError::transport(format!(
                "no client available for {gvk}"
            )));
        }
        Ok(Arc::new(MemoryResourceClient {
            cluster: self.clone(),
            gvk: gvk.clone(),
            namespace: namespace.to_string(),
        }))
    }
}

impl BundleClient for MemoryCluster {
    fn get<'a>(&'a self, namespace: &str, name: &str) -> ApiFuture<'a, Option<Bundle>> {
        let key = (namespace.to_string(), name.to_string());
        Box::pin(async move { Ok(self.lock().bundles.get(&key).cloned()) })
    }

    fn list<'a>(&'a self, namespace: &str) -> ApiFuture<'a, Vec<Bundle>> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            Ok(self
                .lock()
                .bundles
                .values()
                .filter(|bundle| bundle.namespace() == namespace)
                .cloned()
                .collect())
        })
    }

    fn update<'a>(&'a self, bundle: &Bundle) -> ApiFuture<'a, Bundle> {
        let bundle = bundle.clone();
        Box::pin(async move {
            let mut state = self.lock();
            Self::record(
                &mut state,
                Verb::BundleUpdate,
                &Bundle::gvk(),
                bundle.namespace(),
                bundle.name(),
            );
            if let Some(error) = Self::take_queued_error(&mut state, Verb::BundleUpdate) {
                return Err(error);
            }
            let key = (bundle.namespace().to_string(), bundle.name().to_string());
            if !state.bundles.contains_key(&key) {
                return Err(ApiError::not_found(format!(
                    "bundle {}/{} not found",
                    bundle.namespace(),
                    bundle.name()
                )));
            }
            state.bundles.insert(key, bundle.clone());
            Ok(bundle)
        })
    }
}
