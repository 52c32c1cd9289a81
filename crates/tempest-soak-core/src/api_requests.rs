//! API request log analysis.
//!
//! API pods log one line per handled request. Two shapes are recognised:
//!
//! ```text
//! 2025-11-06 13:16:34.123 7 INFO nova.api.wsgi [req-..] 10.0.0.1 "GET /v2.1/servers HTTP/1.1" status: 200 len: 512 time: 0.0312
//! 2025-11-06 13:16:34.123 ... GET /v2.1/servers HTTP/1.1 ... 200 0.0312
//! ```

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::pods::{leading_segment, PodMatcher};

const LOG_FETCH_CONCURRENCY: usize = 4;

fn wsgi_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?).*?"(GET|POST|PUT|DELETE|PATCH|HEAD|OPTIONS)\s+([^"\s]+)[^"]*"\s+status:\s+(\d{3})\s+len:\s+\d+\s+time:\s+(\d+(?:\.\d+)?)"#,
        )
        .expect("wsgi request regex")
    })
}

fn access_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?).*?\b(GET|POST|PUT|DELETE|PATCH|HEAD|OPTIONS)\s+(\S+)\s+.*?\s(\d{3})\s+(\d+(?:\.\d+)?)\b",
        )
        .expect("access request regex")
    })
}

/// One handled API request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiRequest {
    pub timestamp: NaiveDateTime,
    pub pod_name: String,
    pub service: String,
    pub method: String,
    pub endpoint: String,
    pub status_code: u16,

    /// Seconds.
    pub response_time: f64,
}

impl ApiRequest {
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }
}

/// Parse one log line into a request, if it is a request line.
pub fn parse_request_line(line: &str, pod_name: &str, service: &str) -> Option<ApiRequest> {
    let caps = wsgi_line_re()
        .captures(line)
        .or_else(|| access_line_re().captures(line))?;

    let raw_ts = caps.get(1)?.as_str();
    let timestamp = NaiveDateTime::parse_from_str(raw_ts, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| debug!(line, error = %e, "Unparseable request timestamp"))
        .ok()?;
    let status_code = caps.get(4)?.as_str().parse().ok()?;
    let response_time = caps.get(5)?.as_str().parse().ok()?;

    Some(ApiRequest {
        timestamp,
        pod_name: pod_name.to_string(),
        service: service.to_string(),
        method: caps.get(2)?.as_str().to_uppercase(),
        endpoint: caps.get(3)?.as_str().to_string(),
        status_code,
        response_time,
    })
}

pub fn parse_api_log(text: &str, pod_name: &str, service: &str) -> Vec<ApiRequest> {
    text.lines()
        .filter_map(|line| parse_request_line(line, pod_name, service))
        .collect()
}

/// Request counts of one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRequests {
    pub requests: u64,
    pub errors: u64,
}

/// Aggregated API request statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiReport {
    pub total_requests: u64,
    pub error_requests: u64,
    pub client_errors: u64,
    pub server_errors: u64,

    /// Percentage of non-error requests; 0 when there were none.
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub by_service: BTreeMap<String, ServiceRequests>,
    pub pods_analyzed: Vec<String>,
    pub requests: Vec<ApiRequest>,
}

impl ApiReport {
    pub fn from_requests(requests: Vec<ApiRequest>, pods_analyzed: Vec<String>) -> Self {
        let mut report = ApiReport {
            pods_analyzed,
            ..Default::default()
        };
        if requests.is_empty() {
            return report;
        }

        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for req in &requests {
            report.total_requests += 1;
            let entry = report.by_service.entry(req.service.clone()).or_default();
            entry.requests += 1;
            if req.is_error() {
                report.error_requests += 1;
                entry.errors += 1;
            }
            if req.is_client_error() {
                report.client_errors += 1;
            }
            if req.is_server_error() {
                report.server_errors += 1;
            }
            sum += req.response_time;
            min = min.min(req.response_time);
            max = max.max(req.response_time);
        }

        let total = report.total_requests as f64;
        report.success_rate = (total - report.error_requests as f64) / total * 100.0;
        report.avg_response_time = sum / total;
        report.min_response_time = min;
        report.max_response_time = max;
        report.requests = requests;
        report
    }
}

/// Analyze request logs of running API pods since `since`.
pub async fn collect_api_requests(
    cluster: &dyn ClusterClient,
    namespace: &str,
    matcher: &PodMatcher,
    since: DateTime<Utc>,
) -> ApiReport {
    let pods = match cluster.list_pods(namespace, matcher).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(error = %e, "Could not list API pods");
            return ApiReport::default();
        }
    };

    let targets: Vec<(String, String)> = pods
        .into_iter()
        .filter(|p| p.phase == "Running")
        .filter_map(|p| {
            let idx = matcher.position(&p.name)?;
            let service = leading_segment(matcher.pattern(idx).unwrap_or(&p.name));
            Some((p.name, service))
        })
        .collect();

    if targets.is_empty() {
        warn!("No API pods detected");
        return ApiReport::default();
    }

    let parsed: Vec<(String, Vec<ApiRequest>)> = stream::iter(targets)
        .map(|(pod, service)| async move {
            match cluster.pod_logs(namespace, &pod, since).await {
                Ok(text) => {
                    let requests = parse_api_log(&text, &pod, &service);
                    debug!(pod = %pod, requests = requests.len(), "Parsed API requests");
                    (pod, requests)
                }
                Err(e) => {
                    warn!(pod = %pod, error = %e, "Could not get API pod logs");
                    (pod, Vec::new())
                }
            }
        })
        .buffered(LOG_FETCH_CONCURRENCY)
        .collect()
        .await;

    let mut pods_analyzed = Vec::new();
    let mut all = Vec::new();
    for (pod, requests) in parsed {
        if !requests.is_empty() {
            pods_analyzed.push(pod);
            all.extend(requests);
        }
    }

    let report = ApiReport::from_requests(all, pods_analyzed);
    info!(
        total = report.total_requests,
        errors = report.error_requests,
        success_rate = %format!("{:.2}", report.success_rate),
        avg_response_time = %format!("{:.3}", report.avg_response_time),
        "API analysis complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    const WSGI: &str = r#"2025-11-06 13:16:34.123 7 INFO nova.api.openstack.requestlog [req-1 - - - -] 10.128.0.5 "GET /v2.1/servers/detail HTTP/1.1" status: 200 len: 512 time: 0.0312"#;

    #[test]
    fn test_parse_wsgi_line() {
        let line = r#"2025-11-06 13:16:34.123 7 INFO nova.api [req-1] 10.128.0.5 "POST /v2.1/servers HTTP/1.1" status: 503 len: 12 time: 1.25"#;
        let req = parse_request_line(line, "nova-api-0", "nova").expect("request");
        assert_eq!(req.method, "POST");
        assert_eq!(req.endpoint, "/v2.1/servers");
        assert_eq!(req.status_code, 503);
        assert!((req.response_time - 1.25).abs() < 1e-9);
        assert!(req.is_server_error());
        assert!(!req.is_client_error());
    }

    #[test]
    fn test_parse_access_line() {
        let line = "2025-11-06 13:16:34.123 1 INFO access GET /v3/auth/tokens HTTP/1.1 - 404 0.004";
        let req = parse_request_line(line, "keystone-1", "keystone").expect("request");
        assert_eq!(req.method, "GET");
        assert_eq!(req.endpoint, "/v3/auth/tokens");
        assert_eq!(req.status_code, 404);
        assert!(req.is_client_error());
    }

    #[test]
    fn test_non_request_lines_ignored() {
        let text = "2025-11-06 13:16:34.123 7 INFO nova.compute Instance spawned\nrandom text";
        assert!(parse_api_log(text, "nova-api-0", "nova").is_empty());
    }

    #[test]
    fn test_report_statistics() {
        let mut requests = Vec::new();
        for (status, time) in [(200, 0.1), (201, 0.3), (404, 0.2), (500, 0.4)] {
            let mut req = parse_request_line(WSGI, "nova-api-0", "nova").unwrap();
            req.status_code = status;
            req.response_time = time;
            requests.push(req);
        }

        let report = ApiReport::from_requests(requests, vec!["nova-api-0".to_string()]);
        assert_eq!(report.total_requests, 4);
        assert_eq!(report.error_requests, 2);
        assert_eq!(report.client_errors, 1);
        assert_eq!(report.server_errors, 1);
        assert!((report.success_rate - 50.0).abs() < 1e-9);
        assert!((report.avg_response_time - 0.25).abs() < 1e-9);
        assert!((report.min_response_time - 0.1).abs() < 1e-9);
        assert!((report.max_response_time - 0.4).abs() < 1e-9);
        assert_eq!(report.by_service["nova"].errors, 2);
    }

    #[test]
    fn test_empty_report() {
        let report = ApiReport::from_requests(Vec::new(), Vec::new());
        assert_eq!(report.total_requests, 0);
        assert_eq!(report.success_rate, 0.0);
    }
}
