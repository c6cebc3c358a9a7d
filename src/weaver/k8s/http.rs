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

//! HTTP-backed dynamic API client.
//!
//! Speaks the host API server's resource protocol: collections live at
//! `/api/{version}` for the core group and `/apis/{group}/{version}`
//! otherwise, namespaced under `namespaces/{namespace}/{resource}`. Reads
//! are retried a bounded number of times on transport failures and
//! server-side throttling; writes are never retried here — the sync task
//! owns that policy.

use crate::weaver::api::types::{
    Bundle, BundleList, BUNDLE_GROUP, BUNDLE_KIND, BUNDLE_NAME_LABEL, BUNDLE_VERSION,
};
use crate::weaver::k8s::client::{
    ApiError, ApiFuture, BundleClient, DeleteOptions, ObjectStore, ResourceClient, SmartClient,
};
use crate::weaver::k8s::dynamic::{DynamicObject, GroupVersionKind};
use crate::weaver::logger::log_debug;
use crate::weaver::util::with_context;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::error::Error;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::sleep;

const COMPONENT: &str = "http-client";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn next_backoff(current: Duration) -> Duration {
    current.checked_mul(2).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
}

/// Maps the lowercase plural resource path segment for a kind, following
/// the API machinery's kind-to-resource convention.
fn resource_path(kind: &str) -> String {
    let lowered = kind.to_lowercase();
    match lowered.chars().last() {
        Some('s') => format!("{lowered}es"),
        Some('y') => format!("{}ies", &lowered[..lowered.len() - 1]),
        _ => format!("{lowered}s"),
    }
}

fn classify_status(status: StatusCode, method: &Method, detail: String) -> ApiError {
    match status {
        StatusCode::NOT_FOUND => ApiError::not_found(detail),
        StatusCode::CONFLICT if method == Method::POST => ApiError::already_exists(detail),
        StatusCode::CONFLICT => ApiError::conflict(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ApiError::invalid(detail),
        _ => ApiError::server(detail),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<DynamicObject>,
}

struct HttpInner {
    client: Client,
    base: Url,
    /// Resource types this controller has touched; deletion reconciliation
    /// lists each of them by the bundle label.
    managed: RwLock<HashSet<GroupVersionKind>>,
}

/// Dynamic client over one API server endpoint. Cloning shares the
/// connection pool and the managed-type set.
#[derive(Clone)]
pub struct HttpApi {
    inner: Arc<HttpInner>,
}

impl HttpApi {
    pub fn new(server: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let base = Url::parse(server)
            .map_err(|err| with_context(err, format!("invalid API server URL {server:?}")))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| with_context(err, "failed to build HTTP client"))?;
        Ok(Self {
            inner: Arc::new(HttpInner {
                client,
                base,
                managed: RwLock::new(HashSet::new()),
            }),
        })
    }

    /// Registers a resource type as managed so deletion reconciliation
    /// covers it.
    pub fn track_gvk(&self, gvk: &GroupVersionKind) {
        self.inner
            .managed
            .write()
            .expect("managed type set poisoned")
            .insert(gvk.clone());
    }

    fn managed_gvks(&self) -> Vec<GroupVersionKind> {
        self.inner
            .managed
            .read()
            .expect("managed type set poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn collection_url(&self, gvk: &GroupVersionKind, namespace: &str) -> Url {
        let prefix = if gvk.group.is_empty() {
            format!("api/{}", gvk.version)
        } else {
            format!("apis/{}/{}", gvk.group, gvk.version)
        };
        let path = format!(
            "{prefix}/namespaces/{namespace}/{}",
            resource_path(&gvk.kind)
        );
        self.inner
            .base
            .join(&path)
            .expect("collection path joins onto the base URL")
    }

    fn object_url(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Url {
        let mut url = self.collection_url(gvk, namespace);
        url.path_segments_mut()
            .expect("API base URL can carry path segments")
            .push(name);
        url
    }

    async fn read_error(response: reqwest::Response, method: &Method) -> ApiError {
        let status = response.status();
        let url = response.url().clone();
        let body = response.text().await.unwrap_or_default();
        let detail = if body.trim().is_empty() {
            format!("{method} {url} returned {status}")
        } else {
            format!("{method} {url} returned {status}: {}", body.trim())
        };
        classify_status(status, method, detail)
    }

    /// GET with bounded retry on transport failures and throttling. A 404
    /// is not an error at this layer; callers decide what absence means.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, ApiError> {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.client.get(url.clone()).send().await {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(response) if response.status().is_success() => {
                    return response.json::<T>().await.map(Some).map_err(|err| {
                        ApiError::server(format!("failed to decode {url}: {err}"))
                    });
                }
                Ok(response) => {
                    let retryable = should_retry_status(response.status());
                    let error = Self::read_error(response, &Method::GET).await;
                    if !retryable || attempt >= RETRY_ATTEMPTS {
                        return Err(error);
                    }
                    log_debug(
                        COMPONENT,
                        "Retrying read after server error",
                        &[("url", url.as_str()), ("error", &error.to_string())],
                    );
                }
                Err(err) => {
                    if !is_retryable_reqwest(&err) || attempt >= RETRY_ATTEMPTS {
                        return Err(ApiError::transport(format!("GET {url} failed: {err}")));
                    }
                    log_debug(
                        COMPONENT,
                        "Retrying read after transport error",
                        &[("url", url.as_str()), ("error", &err.to_string())],
                    );
                }
            }
            sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: &serde_json::Value,
    ) -> Result<T, ApiError> {
        let response = self
            .inner
            .client
            .request(method.clone(), url.clone())
            .json(body)
            .send()
            .await
            .map_err(|err| ApiError::transport(format!("{method} {url} failed: {err}")))?;
        if !response.status().is_success() {
            return Err(Self::read_error(response, &method).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ApiError::server(format!("failed to decode {url}: {err}")))
    }

    fn bundle_gvk() -> GroupVersionKind {
        GroupVersionKind::new(BUNDLE_GROUP, BUNDLE_VERSION, BUNDLE_KIND)
    }
}

impl ObjectStore for HttpApi {
    fn get<'a>(
        &'a self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> ApiFuture<'a, Option<DynamicObject>> {
        self.track_gvk(gvk);
        let url = self.object_url(gvk, namespace, name);
        Box::pin(async move { self.get_json(url).await })
    }

    fn list_for_bundle<'a>(
        &'a self,
        namespace: &str,
        bundle_name: &str,
    ) -> ApiFuture<'a, Vec<DynamicObject>> {
        let selector = format!("{BUNDLE_NAME_LABEL}={bundle_name}");
        let namespace = namespace.to_string();
        Box::pin(async move {
            let mut objects = Vec::new();
            for gvk in self.managed_gvks() {
                let mut url = self.collection_url(&gvk, &namespace);
                url.query_pairs_mut().append_pair("labelSelector", &selector);
                // A vanished collection means the resource type itself is
                // gone; there is nothing left to garbage collect there.
                if let Some(list) = self.get_json::<ObjectList>(url).await? {
                    objects.extend(list.items);
                }
            }
            Ok(objects)
        })
    }
}

struct HttpResourceClient {
    api: HttpApi,
    gvk: GroupVersionKind,
    namespace: String,
}

impl ResourceClient for HttpResourceClient {
    fn create<'a>(&'a self, object: &DynamicObject) -> ApiFuture<'a, DynamicObject> {
        let url = self.api.collection_url(&self.gvk, &self.namespace);
        let body = object.value().clone();
        Box::pin(async move { self.api.send_json(Method::POST, url, &body).await })
    }

    fn update<'a>(&'a self, object: &DynamicObject) -> ApiFuture<'a, DynamicObject> {
        let name = object.name().unwrap_or_default();
        let url = self.api.object_url(&self.gvk, &self.namespace, name);
        let body = object.value().clone();
        Box::pin(async move { self.api.send_json(Method::PUT, url, &body).await })
    }

    fn delete<'a>(&'a self, name: &str, options: DeleteOptions) -> ApiFuture<'a, ()> {
        let url = self.api.object_url(&self.gvk, &self.namespace, name);
        Box::pin(async move {
            let mut body = json!({
                "propagationPolicy": options.propagation.as_str(),
            });
            if let Some(uid) = options.uid_precondition.as_deref() {
                body["preconditions"] = json!({ "uid": uid });
            }
            let response = self
                .api
                .inner
                .client
                .delete(url.clone())
                .json(&body)
                .send()
                .await
                .map_err(|err| ApiError::transport(format!("DELETE {url} failed: {err}")))?;
            if !response.status().is_success() {
                return Err(HttpApi::read_error(response, &Method::DELETE).await);
            }
            Ok(())
        })
    }
}

impl SmartClient for HttpApi {
    fn for_gvk(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<Arc<dyn ResourceClient>, ApiError> {
        self.track_gvk(gvk);
        Ok(Arc::new(HttpResourceClient {
            api: self.clone(),
            gvk: gvk.clone(),
            namespace: namespace.to_string(),
        }))
    }
}

impl BundleClient for HttpApi {
    fn get<'a>(&'a self, namespace: &str, name: &str) -> ApiFuture<'a, Option<Bundle>> {
        let url = self.object_url(&Self::bundle_gvk(), namespace, name);
        Box::pin(async move { self.get_json(url).await })
    }

    fn list<'a>(&'a self, namespace: &str) -> ApiFuture<'a, Vec<Bundle>> {
        let url = self.collection_url(&Self::bundle_gvk(), namespace);
        Box::pin(async move {
            let list: Option<BundleList> = self.get_json(url).await?;
            Ok(list.map(|list| list.items).unwrap_or_default())
        })
    }

    fn update<'a>(&'a self, bundle: &Bundle) -> ApiFuture<'a, Bundle> {
        let url = self.object_url(&Self::bundle_gvk(), bundle.namespace(), bundle.name());
        let body = serde_json::to_value(bundle);
        Box::pin(async move {
            let body =
                body.map_err(|err| ApiError::invalid(format!("bundle serialization: {err}")))?;
            self.send_json(Method::PUT, url, &body).await
        })
    }
}
