//! Test doubles

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::backend::{BackendReply, KairosResponse, ProxyResponse, QueryResponse};
use crate::engine::traits::TsdbBackend;
use crate::error::BackendQueryFailure;
use crate::query::QueryRequest;
use crate::series::SeriesResult;
use crate::types::{DataPoint, Tags};

/// Backend that answers every query with evenly spaced synthetic samples
///
/// Each sample's value is its timestamp in seconds, so tests can tell
/// exactly which samples came back.
pub struct SyntheticBackend {
    resolution_ms: i64,
    hosts: Vec<String>,
    no_data: bool,
    quiet_after: Mutex<Option<i64>>,
    failure: Mutex<Option<BackendQueryFailure>>,
    requests: Mutex<Vec<QueryRequest>>,
    proxy_routes: Mutex<HashMap<String, ProxyResponse>>,
    proxy_calls: Mutex<Vec<(String, Option<String>)>>,
}

impl SyntheticBackend {
    /// One series per metric, a sample every 10 seconds
    pub fn new() -> Self {
        Self {
            resolution_ms: 10_000,
            hosts: Vec::new(),
            no_data: false,
            quiet_after: Mutex::new(None),
            failure: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            proxy_routes: Mutex::new(HashMap::new()),
            proxy_calls: Mutex::new(Vec::new()),
        }
    }

    /// One series per host, tagged `host=<name>`
    pub fn with_hosts(mut self, hosts: &[&str]) -> Self {
        self.hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    /// Answer with no series at all
    pub fn with_no_data(mut self) -> Self {
        self.no_data = true;
        self
    }

    /// Canned answer for a metadata endpoint
    pub fn with_proxy_route(self, endpoint: &str, status: u16, body: &str) -> Self {
        self.proxy_routes.lock().insert(
            endpoint.to_string(),
            ProxyResponse {
                status,
                body: body.to_string(),
            },
        );
        self
    }

    /// Stop producing samples after `ts_ms`; series are still returned, empty
    pub fn quiet_after(&self, ts_ms: i64) {
        *self.quiet_after.lock() = Some(ts_ms);
    }

    /// Fail every following call
    pub fn fail_with(&self, failure: BackendQueryFailure) {
        *self.failure.lock() = Some(failure);
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Every datapoint query received so far
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    pub fn query_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every metadata request received so far
    pub fn proxy_calls(&self) -> Vec<(String, Option<String>)> {
        self.proxy_calls.lock().clone()
    }

    fn samples(&self, start_ms: i64, end_ms: i64) -> Vec<DataPoint> {
        let res = self.resolution_ms;
        let first = -(-start_ms).div_euclid(res) * res;
        (0..)
            .map(|i| first + i * res)
            .take_while(|ts| *ts <= end_ms)
            .map(|ts| DataPoint::new(ts, (ts / 1000) as f64))
            .collect()
    }

    fn answer(&self, request: &QueryRequest) -> Result<KairosResponse, BackendQueryFailure> {
        let now = Utc::now();
        let (start, end) = request
            .time_range
            .resolve(now)
            .map_err(|e| BackendQueryFailure::Status {
                status: 400,
                message: e.to_string(),
            })?;
        let mut end_ms = end.unwrap_or(now).timestamp_millis();
        if let Some(quiet) = *self.quiet_after.lock() {
            end_ms = end_ms.min(quiet);
        }
        let values = self.samples(start.timestamp_millis(), end_ms);

        let queries = request
            .metrics
            .iter()
            .map(|metric| {
                let results: Vec<SeriesResult> = if self.no_data {
                    Vec::new()
                } else if self.hosts.is_empty() {
                    vec![SeriesResult {
                        tags: metric.tags.clone(),
                        values: values.clone(),
                        ..SeriesResult::placeholder(metric.name.clone())
                    }]
                } else {
                    self.hosts
                        .iter()
                        .map(|host| {
                            let mut tags = Tags::new();
                            tags.insert("host".to_string(), vec![host.clone()]);
                            SeriesResult {
                                tags,
                                values: values.clone(),
                                ..SeriesResult::placeholder(metric.name.clone())
                            }
                        })
                        .collect()
                };
                QueryResponse {
                    sample_size: results.iter().map(|r| r.values.len()).sum(),
                    results,
                }
            })
            .collect();

        Ok(KairosResponse { queries })
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TsdbBackend for SyntheticBackend {
    async fn query(
        &self,
        request: &QueryRequest,
        propagate: bool,
    ) -> Result<BackendReply, BackendQueryFailure> {
        self.requests.lock().push(request.clone());

        let failure = self.failure.lock().clone();
        let outcome = match failure {
            Some(failure) => Err(failure),
            None => self.answer(request),
        };

        match outcome {
            Ok(response) => Ok(BackendReply::Success(response)),
            Err(failure) if propagate => Err(failure),
            Err(failure) => Ok(BackendReply::from(failure)),
        }
    }

    async fn proxy(
        &self,
        endpoint: &str,
        body: Option<&str>,
    ) -> Result<ProxyResponse, BackendQueryFailure> {
        self.proxy_calls
            .lock()
            .push((endpoint.to_string(), body.map(str::to_string)));

        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }

        Ok(self
            .proxy_routes
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| ProxyResponse {
                status: 404,
                body: r#"{"errors": ["Not found"]}"#.to_string(),
            }))
    }
}
