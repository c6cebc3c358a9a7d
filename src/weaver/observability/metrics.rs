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

use std::error::Error;
use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static BUNDLE_STATE_GAUGE: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("weaver".to_string()), None)
            .expect("failed to initialise weaver metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register weaver metric collector");
    collector
}

/// Outcome label recorded for every reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Success,
    Conflict,
    RetriableError,
    TerminalError,
}

impl ReconcileResult {
    fn as_str(self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::Conflict => "conflict",
            ReconcileResult::RetriableError => "retriable_error",
            ReconcileResult::TerminalError => "terminal_error",
        }
    }
}

fn reconciles_total() -> &'static IntCounterVec {
    RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "reconciles_total",
            "Bundle reconciliation passes grouped by result",
        );
        let counter =
            IntCounterVec::new(opts, &["result"]).expect("failed to build reconcile counter");
        register_collector(counter)
    })
}

fn bundle_state_gauge() -> &'static IntGaugeVec {
    BUNDLE_STATE_GAUGE.get_or_init(|| {
        let opts = Opts::new("bundles", "Known bundles grouped by condition state");
        let gauge = IntGaugeVec::new(opts, &["state"]).expect("failed to build bundle gauge");
        register_collector(gauge)
    })
}

pub fn record_reconcile(result: ReconcileResult) {
    reconciles_total()
        .with_label_values(&[result.as_str()])
        .inc();
}

pub fn set_bundle_gauges(ready: i64, converging: i64) {
    let gauge = bundle_state_gauge();
    gauge.with_label_values(&["ready"]).set(ready);
    gauge.with_label_values(&["converging"]).set(converging);
}

/// Renders the registry in the Prometheus text exposition format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}
