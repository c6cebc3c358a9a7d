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

//! One reconciliation pass for one Bundle.
//!
//! The task parses the Bundle into a resource graph, traverses it in
//! topological order, asserts that every resource exists with the desired
//! specification, deletes objects that were removed from the Bundle, and
//! folds the outcome into the Bundle's status conditions. A resource is
//! processed only once all of its dependencies reached a ready state; a
//! skipped resource is picked up by a later pass triggered through watching.

use crate::weaver::api::types::{
    Bundle, BundleCondition, BundleConditionType, ConditionStatus, Resource, BUNDLE_NAME_LABEL,
};
use crate::weaver::controller::error::{SyncError, SyncFailure};
use crate::weaver::controller::ready::ReadyChecker;
use crate::weaver::controller::references::ReferenceResolver;
use crate::weaver::controller::speccheck::compare_actual_vs_spec;
use crate::weaver::controller::status::BundleConditionReason;
use crate::weaver::k8s::client::{
    ApiError, BundleClient, DeleteOptions, DeletionPropagation, ObjectStore, ResourceClient,
    SmartClient,
};
use crate::weaver::k8s::dynamic::{DynamicError, DynamicObject, ObjectRef, OwnerReference};
use crate::weaver::logger::{log_debug, log_info, log_warn};
use crate::weaver::util::graph::Graph;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "sync-task";

/// Ephemeral state for one reconciliation pass over one Bundle.
pub struct SyncTask {
    bundle: Bundle,
    store: Arc<dyn ObjectStore>,
    client: Arc<dyn SmartClient>,
    bundles: Arc<dyn BundleClient>,
    ready_checker: Arc<ReadyChecker>,
    cancel: CancellationToken,
    ready_resources: HashMap<String, DynamicObject>,
}

impl SyncTask {
    pub fn new(
        bundle: Bundle,
        store: Arc<dyn ObjectStore>,
        client: Arc<dyn SmartClient>,
        bundles: Arc<dyn BundleClient>,
        ready_checker: Arc<ReadyChecker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bundle,
            store,
            client,
            bundles,
            ready_checker,
            cancel,
            ready_resources: HashMap::new(),
        }
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    /// Runs an API call, surfacing caller cancellation as its own error.
    async fn guard<T>(
        &self,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<Result<T, ApiError>, SyncFailure> {
        match self.cancel.run_until_cancelled(call).await {
            None => Err(SyncFailure::terminal(SyncError::Cancelled)),
            Some(result) => Ok(result),
        }
    }

    /// One reconciliation pass: create or update every declared resource in
    /// dependency order, then delete objects dropped from the Bundle.
    pub async fn process(&mut self) -> Result<(), SyncFailure> {
        let resources = self.bundle.spec.resources.clone();

        let mut resource_map: HashMap<String, Resource> =
            HashMap::with_capacity(resources.len());
        for resource in resources {
            let name = resource.name.clone();
            if resource_map.insert(name.clone(), resource).is_some() {
                return Err(SyncFailure::terminal(SyncError::DuplicateResource(name)));
            }
        }

        let (graph, sorted) = sort_bundle(&self.bundle)?;
        self.ready_resources = HashMap::with_capacity(resource_map.len());

        'next_vertex: for name in &sorted {
            for &dependency in graph.dependencies_of(name) {
                let dependency = graph.name_of(dependency);
                if !self.ready_resources.contains_key(dependency) {
                    log_debug(
                        COMPONENT,
                        "Dependency is not ready yet, skipping resource",
                        &[
                            ("namespace", self.bundle.namespace()),
                            ("bundle", self.bundle.name()),
                            ("resource", name),
                            ("dependency", dependency),
                        ],
                    );
                    continue 'next_vertex;
                }
            }

            let resource = resource_map
                .get(name)
                .expect("every sorted vertex came from the resource map");
            log_debug(
                COMPONENT,
                "Checking resource",
                &[
                    ("namespace", self.bundle.namespace()),
                    ("bundle", self.bundle.name()),
                    ("resource", name),
                ],
            );
            let ready_object = self.check_resource(resource).await?;
            let is_ready = ready_object.is_some();
            log_debug(
                COMPONENT,
                "Resource checked",
                &[
                    ("namespace", self.bundle.namespace()),
                    ("bundle", self.bundle.name()),
                    ("resource", name),
                    ("ready", if is_ready { "true" } else { "false" }),
                ],
            );
            if let Some(object) = ready_object {
                self.ready_resources.insert(name.clone(), object);
            }
        }

        self.delete_removed_resources().await?;
        Ok(())
    }

    /// Ensures one resource exists with the desired spec and reports its
    /// observed object once it is ready.
    async fn check_resource(
        &self,
        resource: &Resource,
    ) -> Result<Option<DynamicObject>, SyncFailure> {
        let spec = self.eval_spec(resource)?;
        let applied = self.create_or_update(&spec).await?;

        match self.ready_checker.is_ready(&applied) {
            Err(err) => Err(SyncFailure {
                retriable: err.retriable,
                error: SyncError::ReadyCheck {
                    message: err.message,
                },
            }),
            Ok(false) => Ok(None),
            Ok(true) => Ok(Some(applied)),
        }
    }

    /// Evaluates the resource specification: resolves references, stamps
    /// labels, and rewrites owner references.
    fn eval_spec(&self, resource: &Resource) -> Result<DynamicObject, SyncFailure> {
        let mut spec = resource.spec.clone();

        let resolver = ReferenceResolver::new(
            &resource.name,
            &self.ready_resources,
            &resource.depends_on,
        );
        resolver
            .process(spec.value_mut())
            .map_err(SyncFailure::terminal)?;

        let mut labels = self.bundle.metadata.labels.clone();
        labels.extend(spec.labels());
        labels.insert(
            BUNDLE_NAME_LABEL.to_string(),
            self.bundle.name().to_string(),
        );
        spec.set_labels(labels);

        let bundle_ref = self.bundle.controller_owner_ref();
        let mut references = spec.owner_references();
        for reference in &mut references {
            if reference.is_controller() && reference.key() != bundle_ref.key() {
                return Err(SyncFailure::terminal(SyncError::ForeignController {
                    object: describe(&spec),
                }));
            }
            reference.block_owner_deletion = Some(true);
        }
        // The controller reference is re-appended below, so any declared
        // copy of it is dropped first.
        references.retain(|reference| !reference.is_controller());
        references.push(bundle_ref);
        for dependency in &resource.depends_on {
            let object = self
                .ready_resources
                .get(dependency)
                .expect("dependency readiness was verified before evaluation");
            references.push(OwnerReference {
                api_version: object.api_version().unwrap_or_default().to_string(),
                kind: object.kind().unwrap_or_default().to_string(),
                name: object.name().unwrap_or_default().to_string(),
                uid: object.uid().unwrap_or_default().to_string(),
                controller: None,
                block_owner_deletion: Some(true),
            });
        }
        let mut seen = HashSet::new();
        references.retain(|reference| {
            let (api_version, kind, name, uid) = reference.key();
            seen.insert((
                api_version.to_string(),
                kind.to_string(),
                name.to_string(),
                uid.to_string(),
            ))
        });
        spec.set_owner_references(references);

        Ok(spec)
    }

    async fn create_or_update(&self, spec: &DynamicObject) -> Result<DynamicObject, SyncFailure> {
        let gvk = spec.gvk().map_err(SyncFailure::terminal)?;
        let name = spec
            .name()
            .ok_or_else(|| SyncFailure::terminal(DynamicError::MissingField("metadata.name")))?
            .to_string();
        let namespace = self.bundle.namespace();

        let client = self
            .client
            .for_gvk(&gvk, namespace)
            .map_err(|err| SyncFailure::terminal(SyncError::Api(err)))?;

        // Read through the store first to avoid generating write traffic
        // for objects that already match.
        let observed = self
            .guard(self.store.get(&gvk, namespace, &name))
            .await?
            .map_err(|err| SyncFailure::terminal(SyncError::Api(err)))?;

        match observed {
            Some(actual) => {
                log_debug(
                    COMPONENT,
                    "Object found, checking spec",
                    &[
                        ("namespace", namespace),
                        ("bundle", self.bundle.name()),
                        ("object", &describe(spec)),
                    ],
                );
                self.update_resource(client.as_ref(), spec, actual).await
            }
            None => {
                log_debug(
                    COMPONENT,
                    "Object not found, creating",
                    &[
                        ("namespace", namespace),
                        ("bundle", self.bundle.name()),
                        ("object", &describe(spec)),
                    ],
                );
                self.create_resource(client.as_ref(), spec).await
            }
        }
    }

    async fn create_resource(
        &self,
        client: &dyn ResourceClient,
        spec: &DynamicObject,
    ) -> Result<DynamicObject, SyncFailure> {
        match self.guard(client.create(spec)).await? {
            Ok(created) => {
                log_info(
                    COMPONENT,
                    "Object created",
                    &[
                        ("namespace", self.bundle.namespace()),
                        ("bundle", self.bundle.name()),
                        ("object", &describe(spec)),
                    ],
                );
                Ok(created)
            }
            Err(err) if err.is_already_exists() || err.is_conflict() => {
                // Someone else created the object and the store has not
                // caught up. The watch event for it re-enqueues the Bundle,
                // so the next pass finishes the work.
                Err(SyncFailure::terminal(SyncError::Conflict {
                    message: format!(
                        "object {} found, but not in the store yet (will re-process): {err}",
                        describe(spec)
                    ),
                }))
            }
            Err(err) => Err(SyncFailure::retriable(SyncError::Api(err))),
        }
    }

    async fn update_resource(
        &self,
        client: &dyn ResourceClient,
        spec: &DynamicObject,
        actual: DynamicObject,
    ) -> Result<DynamicObject, SyncFailure> {
        if actual.deletion_timestamp().is_some() {
            return Err(SyncFailure::terminal(SyncError::BeingDeleted {
                object: describe(&actual),
            }));
        }
        if !actual.is_controlled_by(self.bundle.uid()) {
            return Err(SyncFailure::terminal(SyncError::NotOwned {
                object: describe(&actual),
            }));
        }

        let (merged, equal) = compare_actual_vs_spec(spec, &actual);
        if equal {
            log_debug(
                COMPONENT,
                "Object already has the correct spec",
                &[
                    ("namespace", self.bundle.namespace()),
                    ("bundle", self.bundle.name()),
                    ("object", &describe(spec)),
                ],
            );
            return Ok(merged);
        }

        match self.guard(client.update(&merged)).await? {
            Ok(updated) => {
                log_info(
                    COMPONENT,
                    "Object updated",
                    &[
                        ("namespace", self.bundle.namespace()),
                        ("bundle", self.bundle.name()),
                        ("object", &describe(spec)),
                    ],
                );
                Ok(updated)
            }
            Err(err) if err.is_conflict() => Err(SyncFailure::terminal(SyncError::Conflict {
                message: format!(
                    "object {} update resulted in conflict (will re-process): {err}",
                    describe(spec)
                ),
            })),
            Err(err) => Err(SyncFailure::retriable(SyncError::Api(err))),
        }
    }

    /// Deletes objects the Bundle owns that are no longer declared in its
    /// resource list.
    async fn delete_removed_resources(&self) -> Result<(), SyncFailure> {
        let namespace = self.bundle.namespace();
        let owned = self
            .guard(self.store.list_for_bundle(namespace, self.bundle.name()))
            .await?
            .map_err(|err| SyncFailure::terminal(SyncError::Api(err)))?;

        let mut existing: HashMap<ObjectRef, String> = HashMap::with_capacity(owned.len());
        for object in owned {
            if object.deletion_timestamp().is_some() {
                continue;
            }
            if !object.is_controlled_by(self.bundle.uid()) {
                log_warn(
                    COMPONENT,
                    "Labelled object is not controlled by the bundle, leaving it alone",
                    &[
                        ("namespace", namespace),
                        ("bundle", self.bundle.name()),
                        ("object", &describe(&object)),
                    ],
                );
                continue;
            }
            let Ok(reference) = object.object_ref() else {
                log_warn(
                    COMPONENT,
                    "Owned object has no usable type or name, leaving it alone",
                    &[("namespace", namespace), ("bundle", self.bundle.name())],
                );
                continue;
            };
            existing.insert(reference, object.uid().unwrap_or_default().to_string());
        }

        for resource in &self.bundle.spec.resources {
            if let Ok(reference) = resource.spec.object_ref() {
                existing.remove(&reference);
            }
        }

        let mut first_error: Option<SyncError> = None;
        let mut retriable = true;
        for (reference, uid) in existing {
            log_info(
                COMPONENT,
                "Deleting object removed from the bundle",
                &[
                    ("namespace", namespace),
                    ("bundle", self.bundle.name()),
                    ("object", &reference.to_string()),
                ],
            );
            let client = match self.client.for_gvk(&reference.gvk, namespace) {
                Ok(client) => client,
                Err(err) => {
                    if first_error.is_none() {
                        // Client resolution is a structural problem, not a
                        // transient one.
                        retriable = false;
                        first_error = Some(SyncError::Api(err));
                    } else {
                        log_warn(
                            COMPONENT,
                            "Failed to get client for object",
                            &[
                                ("namespace", namespace),
                                ("bundle", self.bundle.name()),
                                ("object", &reference.to_string()),
                                ("error", &err.to_string()),
                            ],
                        );
                    }
                    continue;
                }
            };

            let options = DeleteOptions {
                uid_precondition: Some(uid),
                propagation: DeletionPropagation::Foreground,
            };
            match self.guard(client.delete(&reference.name, options)).await? {
                Ok(()) => {}
                // Not found means the object is gone already; a conflict
                // means it was deleted and re-created under a new UID.
                Err(err) if err.is_not_found() || err.is_conflict() => {}
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(SyncError::Api(err));
                    } else {
                        log_warn(
                            COMPONENT,
                            "Failed to delete object",
                            &[
                                ("namespace", namespace),
                                ("bundle", self.bundle.name()),
                                ("object", &reference.to_string()),
                                ("error", &err.to_string()),
                            ],
                        );
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(SyncFailure { retriable, error }),
            None => Ok(()),
        }
    }

    fn is_bundle_ready(&self) -> bool {
        self.bundle
            .spec
            .resources
            .iter()
            .all(|resource| self.ready_resources.contains_key(&resource.name))
    }

    async fn set_bundle_status(&self) -> Result<(), SyncError> {
        match self.cancel.run_until_cancelled(self.bundles.update(&self.bundle)).await {
            None => Err(SyncError::Cancelled),
            Some(Err(err)) if err.is_conflict() => {
                // Something updated the Bundle concurrently, possibly our
                // own previous pass whose event has not come back yet. The
                // update event re-enqueues the Bundle, so the conflict is
                // safe to ignore.
                log_debug(
                    COMPONENT,
                    "Bundle status write conflicted, deferring to the next event",
                    &[
                        ("namespace", self.bundle.namespace()),
                        ("bundle", self.bundle.name()),
                    ],
                );
                Ok(())
            }
            Some(Err(err)) => Err(SyncError::Api(err)),
            Some(Ok(_)) => {
                log_info(
                    COMPONENT,
                    "Bundle status updated",
                    &[
                        ("namespace", self.bundle.namespace()),
                        ("bundle", self.bundle.name()),
                    ],
                );
                Ok(())
            }
        }
    }

    /// Folds the outcome of [`SyncTask::process`] into the Bundle's status
    /// conditions and writes them back when their effective value changed.
    pub async fn handle_process_result(
        &mut self,
        result: Result<(), SyncFailure>,
    ) -> Result<(), SyncFailure> {
        if let Err(failure) = &result {
            // Write conflicts surface through the next watch event and must
            // not disturb the recorded status.
            if failure.error.is_conflict() {
                return result;
            }
            if failure.error.is_cancelled() {
                return Err(SyncFailure::terminal(SyncError::Cancelled));
            }
        }

        let mut in_progress =
            BundleCondition::new(BundleConditionType::InProgress, ConditionStatus::False);
        let mut ready = BundleCondition::new(BundleConditionType::Ready, ConditionStatus::False);
        let mut error = BundleCondition::new(BundleConditionType::Error, ConditionStatus::False);

        match &result {
            Ok(()) => {
                if self.is_bundle_ready() {
                    ready.status = ConditionStatus::True;
                } else {
                    in_progress.status = ConditionStatus::True;
                }
            }
            Err(failure) => {
                error.status = ConditionStatus::True;
                error.message = Some(failure.error.to_string());
                if failure.retriable {
                    error.reason =
                        Some(BundleConditionReason::RetriableError.as_str().to_string());
                    in_progress.status = ConditionStatus::True;
                } else {
                    error.reason =
                        Some(BundleConditionReason::TerminalError.as_str().to_string());
                }
            }
        }

        let in_progress_updated = self.bundle.update_condition(in_progress);
        let ready_updated = self.bundle.update_condition(ready);
        let error_updated = self.bundle.update_condition(error);

        if in_progress_updated || ready_updated || error_updated {
            match self.set_bundle_status().await {
                Ok(()) => {}
                Err(SyncError::Cancelled) => {
                    return Err(SyncFailure::terminal(SyncError::Cancelled));
                }
                Err(err) => {
                    // A failed status write only overrides a successful
                    // pass; an already failed pass keeps its own error.
                    if result.is_ok() {
                        return Err(SyncFailure::retriable(err));
                    }
                }
            }
        }

        result
    }
}

fn describe(object: &DynamicObject) -> String {
    let type_name = match object.gvk() {
        Ok(gvk) => gvk.to_string(),
        Err(_) => "<unknown type>".to_string(),
    };
    format!("{type_name} {:?}", object.name().unwrap_or_default())
}

fn sort_bundle(bundle: &Bundle) -> Result<(Graph, Vec<String>), SyncFailure> {
    let mut graph = Graph::with_capacity(bundle.spec.resources.len());
    for resource in &bundle.spec.resources {
        graph.add_vertex(&resource.name);
    }
    for resource in &bundle.spec.resources {
        for dependency in &resource.depends_on {
            graph
                .add_edge(&resource.name, dependency)
                .map_err(SyncFailure::terminal)?;
        }
    }
    let sorted = graph.topo_sort().map_err(SyncFailure::terminal)?;
    Ok((graph, sorted))
}
