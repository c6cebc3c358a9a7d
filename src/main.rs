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

use clap::Parser;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use weaver::weaver::api::types::{BundleConditionType, ConditionStatus};
use weaver::weaver::config::Config;
use weaver::weaver::controller::ready::{ConditionReady, ReadyChecker};
use weaver::weaver::controller::worker::{BundleKey, BundleReconciler, WorkerPool};
use weaver::weaver::k8s::client::BundleClient;
use weaver::weaver::k8s::http::HttpApi;
use weaver::weaver::logger::{
    log_error, log_info, log_warn, set_log_format, set_log_level, LogFormat, LogLevel,
};
use weaver::weaver::observability::{http as observability_http, metrics};
use weaver::weaver::util::with_context;

const COMPONENT: &str = "main";

/// Reconciles declarative resource bundles against the cluster API server.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct WeaverArgs {
    /// Base URL of the API server (defaults to WEAVER_SERVER).
    #[arg(long)]
    server: Option<String>,

    /// Namespace to reconcile (defaults to WEAVER_NAMESPACE).
    #[arg(long)]
    namespace: Option<String>,

    /// Number of reconciliation workers (defaults to WEAVER_WORKERS).
    #[arg(long)]
    workers: Option<usize>,

    /// Interval between full re-enqueues, e.g. "5m" (defaults to
    /// WEAVER_RESYNC_INTERVAL).
    #[arg(long)]
    resync_interval: Option<String>,

    /// Log output format, "text" or "json" (defaults to WEAVER_LOG_FORMAT).
    #[arg(long)]
    log_format: Option<String>,

    /// Listen address for /metrics and /healthz (defaults to
    /// WEAVER_METRICS_ADDR).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = WeaverArgs::parse();
    if let Err(err) = run(args).await {
        log_error(COMPONENT, "Controller failed", &[("error", &err.to_string())]);
        std::process::exit(1);
    }
}

async fn run(args: WeaverArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let log_format = args
        .log_format
        .unwrap_or_else(|| Config::LogFormat.get());
    if log_format.eq_ignore_ascii_case("json") {
        set_log_format(LogFormat::Json);
    }
    if args.debug {
        set_log_level(LogLevel::Debug);
    }

    let server = args.server.unwrap_or_else(|| Config::Server.get());
    let namespace = args.namespace.unwrap_or_else(|| Config::Namespace.get());
    let workers = args.workers.unwrap_or_else(|| Config::Workers.get_usize());
    let resync = match args.resync_interval {
        Some(raw) => humantime::parse_duration(&raw)
            .map_err(|err| with_context(err, format!("invalid resync interval {raw:?}")))?,
        None => Config::ResyncInterval.get_duration(),
    };
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .unwrap_or_else(|| Config::MetricsAddr.get())
        .parse()
        .map_err(|err| with_context(err, "invalid metrics listen address"))?;

    log_info(
        COMPONENT,
        "Starting bundle controller",
        &[
            ("server", server.as_str()),
            ("namespace", namespace.as_str()),
            ("workers", &workers.to_string()),
            ("resync", &humantime::format_duration(resync).to_string()),
        ],
    );

    let api = HttpApi::new(&server)?;
    let ready_checker = Arc::new(default_ready_checker());

    let cancel = CancellationToken::new();
    let reconciler = Arc::new(BundleReconciler::new(
        Arc::new(api.clone()),
        Arc::new(api.clone()),
        Arc::new(api.clone()),
        ready_checker,
    ));
    let pool = WorkerPool::new(reconciler, workers, cancel.clone());

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log_info(COMPONENT, "Received interrupt, shutting down", &[]);
                cancel.cancel();
            }
        });
    }
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = observability_http::serve(metrics_addr, cancel).await {
                log_warn(
                    COMPONENT,
                    "Metrics listener stopped",
                    &[("error", &err.to_string())],
                );
            }
        });
    }

    resync_loop(&api, &pool, &namespace, resync, cancel.clone()).await;

    log_info(COMPONENT, "Controller stopped", &[]);
    Ok(())
}

fn default_ready_checker() -> ReadyChecker {
    let mut checker = ReadyChecker::new();
    checker.register(
        "apps",
        "Deployment",
        Arc::new(ConditionReady {
            condition_type: "Available".to_string(),
        }),
    );
    checker.register(
        "batch",
        "Job",
        Arc::new(ConditionReady {
            condition_type: "Complete".to_string(),
        }),
    );
    checker
}

/// Lists all Bundles and enqueues them, repeating every resync interval so
/// dropped intermediate states converge even without watch events.
async fn resync_loop(
    api: &HttpApi,
    pool: &WorkerPool,
    namespace: &str,
    resync: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(resync);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let bundles = match api.list(namespace).await {
            Ok(bundles) => bundles,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Failed to list bundles, will retry on the next resync",
                    &[("namespace", namespace), ("error", &err.to_string())],
                );
                continue;
            }
        };

        let mut ready = 0i64;
        let mut converging = 0i64;
        for bundle in &bundles {
            for resource in &bundle.spec.resources {
                if let Ok(gvk) = resource.spec.gvk() {
                    api.track_gvk(&gvk);
                }
            }
            let is_ready = bundle
                .condition(BundleConditionType::Ready)
                .is_some_and(|condition| condition.status == ConditionStatus::True);
            if is_ready {
                ready += 1;
            } else {
                converging += 1;
            }
            pool.enqueue(BundleKey::for_bundle(bundle));
        }
        metrics::set_bundle_gauges(ready, converging);
        log_info(
            COMPONENT,
            "Resync pass enqueued bundles",
            &[
                ("namespace", namespace),
                ("bundles", &bundles.len().to_string()),
            ],
        );
    }
}
