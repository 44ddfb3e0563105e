//! HTTP client for the Solr admin, update, select and replication APIs.

use async_trait::async_trait;
use moodle_solr_shared::time::Duration;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Map, Value, json};
use snafu::ResultExt;

use crate::external::{
    self, HttpSnafu, QueryCredentials, QueryExecutor, QueryOutcome, RejectedSnafu, ResourceManager,
    ResourceStatus, SnapshotStatus, UnexpectedResponseSnafu,
};

type Result<T, E = external::Error> = std::result::Result<T, E>;

/// Longest error body quoted back in messages.
const MAX_ERROR_BODY: usize = 300;

/// Solr version and JVM figures from `/admin/info/system`.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct SystemInfo {
    pub solr_version: Option<String>,
    pub jvm_version: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub memory_used_bytes: Option<u64>,
    pub memory_max_bytes: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct SolrClient {
    http: reqwest::Client,
    base_url: String,
    admin: Option<QueryCredentials>,
}

impl SolrClient {
    /// `base_url` is the Solr origin, e.g. `http://solr:8983`. Requests made on
    /// behalf of the toolkit itself authenticate as `admin`.
    pub fn new(base_url: &str, admin: Option<QueryCredentials>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(*timeout)
            .build()
            .context(HttpSnafu {
                operation: "build HTTP client",
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            admin,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/solr/{path}", self.base_url)
    }

    fn as_admin(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.admin {
            Some(admin) => request.basic_auth(&admin.username, Some(admin.password.as_str())),
            None => request,
        }
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Value> {
        let response = self
            .as_admin(request)
            .send()
            .await
            .context(HttpSnafu { operation })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return RejectedSnafu {
                operation,
                status: status.as_u16(),
                message: error_message(&body),
            }
            .fail();
        }

        response.json().await.context(HttpSnafu { operation })
    }

    async fn get(&self, operation: &str, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let request = self
            .http
            .get(self.url(path))
            .query(query)
            .query(&[("wt", "json")]);
        self.send(operation, request).await
    }

    async fn core_status(&self, core: Option<&str>) -> Result<Vec<ResourceStatus>> {
        let mut query = vec![("action", "STATUS")];
        if let Some(core) = core {
            query.push(("core", core));
        }
        let response = self
            .get("read core status", "admin/cores", &query)
            .await?;

        let Some(status) = response.get("status").and_then(Value::as_object) else {
            return UnexpectedResponseSnafu {
                operation: "read core status",
                message: "response has no status object",
            }
            .fail();
        };

        Ok(status
            .iter()
            .filter(|(name, details)| {
                !name.is_empty() && details.as_object().is_some_and(|details| !details.is_empty())
            })
            .map(|(name, details)| ResourceStatus {
                name: name.clone(),
                document_count: details.pointer("/index/numDocs").and_then(Value::as_u64),
                index_size_bytes: details
                    .pointer("/index/sizeInBytes")
                    .and_then(Value::as_u64),
                instance_dir: details
                    .get("instanceDir")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned),
            })
            .collect())
    }

    pub async fn system_info(&self) -> Result<SystemInfo> {
        let info = self
            .get("read system info", "admin/info/system", &[])
            .await?;

        Ok(SystemInfo {
            solr_version: info
                .pointer("/lucene/solr-spec-version")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            jvm_version: info
                .pointer("/jvm/version")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            uptime_seconds: info
                .pointer("/jvm/jmx/upTimeMS")
                .and_then(Value::as_u64)
                .map(|millis| millis / 1000),
            memory_used_bytes: info.pointer("/jvm/memory/raw/used").and_then(Value::as_u64),
            memory_max_bytes: info.pointer("/jvm/memory/raw/max").and_then(Value::as_u64),
        })
    }
}

#[async_trait]
impl ResourceManager for SolrClient {
    async fn create_resource(&self, name: &str, template: &str) -> Result<()> {
        self.get(
            &format!("create core {name}"),
            "admin/cores",
            &[("action", "CREATE"), ("name", name), ("configSet", template)],
        )
        .await?;
        tracing::info!(core = name, config_set = template, "created core");
        Ok(())
    }

    async fn delete_resource(&self, name: &str, purge_data: bool) -> Result<()> {
        let purge = if purge_data { "true" } else { "false" };
        self.get(
            &format!("unload core {name}"),
            "admin/cores",
            &[
                ("action", "UNLOAD"),
                ("core", name),
                ("deleteIndex", purge),
                ("deleteDataDir", purge),
                ("deleteInstanceDir", purge),
            ],
        )
        .await?;
        tracing::info!(core = name, purge_data, "unloaded core");
        Ok(())
    }

    async fn resource_status(&self, name: &str) -> Result<Option<ResourceStatus>> {
        Ok(self
            .core_status(Some(name))
            .await?
            .into_iter()
            .find(|status| status.name == name))
    }

    async fn list_resources(&self) -> Result<Vec<ResourceStatus>> {
        self.core_status(None).await
    }

    async fn flush(&self, name: &str) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("{name}/update")))
            .query(&[("commit", "true"), ("wt", "json")])
            .json(&json!({ "commit": {} }));
        self.send(&format!("commit core {name}"), request).await?;
        Ok(())
    }

    async fn document_count(&self, name: &str) -> Result<u64> {
        let operation = format!("count documents of {name}");
        let response = self
            .get(
                &operation,
                &format!("{name}/select"),
                &[("q", "*:*"), ("rows", "0")],
            )
            .await?;

        response
            .pointer("/response/numFound")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                UnexpectedResponseSnafu {
                    operation,
                    message: "response has no numFound",
                }
                .build()
            })
    }

    async fn request_snapshot(&self, name: &str, snapshot: &str, location: &str) -> Result<()> {
        self.get(
            &format!("request snapshot of {name}"),
            &format!("{name}/replication"),
            &[
                ("command", "backup"),
                ("name", snapshot),
                ("location", location),
            ],
        )
        .await?;
        Ok(())
    }

    async fn snapshot_status(&self, name: &str, snapshot: &str) -> Result<SnapshotStatus> {
        let details = self
            .get(
                &format!("read snapshot status of {name}"),
                &format!("{name}/replication"),
                &[("command", "details")],
            )
            .await?;
        Ok(parse_backup_details(&details, snapshot))
    }
}

#[async_trait]
impl QueryExecutor for SolrClient {
    async fn query(&self, resource: &str, credentials: &QueryCredentials) -> QueryOutcome {
        let response = self
            .http
            .get(self.url(&format!("{resource}/select")))
            .query(&[("q", "*:*"), ("rows", "0"), ("wt", "json")])
            .basic_auth(&credentials.username, Some(credentials.password.as_str()))
            .send()
            .await;

        match response {
            Ok(response) => match response.status() {
                status if status.is_success() => QueryOutcome::Success,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => QueryOutcome::AccessDenied,
                status => QueryOutcome::Error {
                    message: format!("HTTP {status}"),
                },
            },
            Err(error) => QueryOutcome::Error {
                message: error.to_string(),
            },
        }
    }
}

/// Interprets the `backup` section of a replication `details` response.
///
/// Depending on the Solr version the section is either an object or a flat
/// `[key, value, key, value, ...]` list.
fn parse_backup_details(details: &Value, snapshot: &str) -> SnapshotStatus {
    let fields: Map<String, Value> = match details.pointer("/details/backup") {
        Some(Value::Object(fields)) => fields.clone(),
        Some(Value::Array(pairs)) => pairs
            .chunks_exact(2)
            .filter_map(|pair| Some((pair[0].as_str()?.to_owned(), pair[1].clone())))
            .collect(),
        _ => return SnapshotStatus::InProgress,
    };

    if fields.get("snapshotName").and_then(Value::as_str) != Some(snapshot) {
        return SnapshotStatus::InProgress;
    }

    match fields.get("status").and_then(Value::as_str) {
        Some(status) if status.eq_ignore_ascii_case("success") => SnapshotStatus::Completed,
        Some(status) if status.eq_ignore_ascii_case("failed") => SnapshotStatus::Failed {
            message: fields
                .get("exception")
                .and_then(Value::as_str)
                .unwrap_or("snapshot failed")
                .to_owned(),
        },
        _ => SnapshotStatus::InProgress,
    }
}

/// Extracts Solr's `error.msg` from an error body, falling back to the raw
/// (truncated) body.
fn error_message(body: &str) -> String {
    if let Some(message) = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.pointer("/error/msg")?.as_str().map(ToOwned::to_owned))
    {
        return message;
    }

    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{basic_auth, body_json, method, path, query_param},
    };
    use zeroize::Zeroizing;

    use super::*;

    fn admin() -> QueryCredentials {
        QueryCredentials {
            username: "admin".to_owned(),
            password: Zeroizing::new("SolrRocks".to_owned()),
        }
    }

    async fn client(server: &MockServer) -> SolrClient {
        SolrClient::new(&server.uri(), Some(admin()), Duration::from_secs(5)).expect("build client")
    }

    #[tokio::test]
    async fn creates_core_as_admin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/solr/admin/cores"))
            .and(query_param("action", "CREATE"))
            .and(query_param("name", "moodle_acme"))
            .and(query_param("configSet", "moodle"))
            .and(basic_auth("admin", "SolrRocks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"responseHeader": {"status": 0}, "core": "moodle_acme"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .create_resource("moodle_acme", "moodle")
            .await
            .expect("core is created");
    }

    #[tokio::test]
    async fn surfaces_solr_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/solr/admin/cores"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "responseHeader": {"status": 500},
                "error": {"msg": "Core with name 'moodle_acme' already exists.", "code": 500}
            })))
            .mount(&server)
            .await;

        let error = client(&server)
            .await
            .create_resource("moodle_acme", "moodle")
            .await
            .expect_err("creation is rejected");

        assert!(matches!(
            &error,
            external::Error::Rejected { status: 500, message, .. }
                if message == "Core with name 'moodle_acme' already exists."
        ));
    }

    #[tokio::test]
    async fn reads_core_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/solr/admin/cores"))
            .and(query_param("action", "STATUS"))
            .and(query_param("core", "moodle_acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": {
                    "moodle_acme": {
                        "name": "moodle_acme",
                        "instanceDir": "/var/solr/data/moodle_acme",
                        "index": {"numDocs": 42, "sizeInBytes": 1024}
                    }
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/solr/admin/cores"))
            .and(query_param("action", "STATUS"))
            .and(query_param("core", "moodle_ghost"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": {"moodle_ghost": {}}})),
            )
            .mount(&server)
            .await;

        let client = client(&server).await;
        let status = client
            .resource_status("moodle_acme")
            .await
            .expect("status request succeeds")
            .expect("core exists");
        assert_eq!(status.document_count, Some(42));
        assert_eq!(status.index_size_bytes, Some(1024));
        assert_eq!(
            status.instance_dir.as_deref(),
            Some("/var/solr/data/moodle_acme")
        );

        assert_eq!(
            client
                .resource_status("moodle_ghost")
                .await
                .expect("status request succeeds"),
            None
        );
    }

    #[tokio::test]
    async fn flushes_with_hard_commit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/solr/moodle_acme/update"))
            .and(query_param("commit", "true"))
            .and(body_json(json!({"commit": {}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responseHeader": {"status": 0}})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .flush("moodle_acme")
            .await
            .expect("commit succeeds");
    }

    #[tokio::test]
    async fn counts_documents() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/solr/moodle_acme/select"))
            .and(query_param("rows", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {"numFound": 1234, "start": 0, "docs": []}
            })))
            .mount(&server)
            .await;

        assert_eq!(
            client(&server)
                .await
                .document_count("moodle_acme")
                .await
                .expect("count succeeds"),
            1234
        );
    }

    #[tokio::test]
    async fn query_maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/solr/moodle_acme/select"))
            .and(basic_auth("acme_customer", "pw"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": {"numFound": 0}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/solr/moodle_other/select"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/solr/moodle_broken/select"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = SolrClient::new(&server.uri(), None, Duration::from_secs(5)).expect("build client");
        let credentials = QueryCredentials {
            username: "acme_customer".to_owned(),
            password: Zeroizing::new("pw".to_owned()),
        };

        assert_eq!(client.query("moodle_acme", &credentials).await, QueryOutcome::Success);
        assert_eq!(
            client.query("moodle_other", &credentials).await,
            QueryOutcome::AccessDenied
        );
        assert!(matches!(
            client.query("moodle_broken", &credentials).await,
            QueryOutcome::Error { .. }
        ));
    }

    #[tokio::test]
    async fn reads_system_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/solr/admin/info/system"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "lucene": {"solr-spec-version": "9.7.0"},
                "jvm": {
                    "version": "17.0.12",
                    "jmx": {"upTimeMS": 65_000},
                    "memory": {"raw": {"used": 100, "max": 400}}
                }
            })))
            .mount(&server)
            .await;

        let info = client(&server).await.system_info().await.expect("system info");

        assert_eq!(info.solr_version.as_deref(), Some("9.7.0"));
        assert_eq!(info.uptime_seconds, Some(65));
        assert_eq!(info.memory_max_bytes, Some(400));
    }

    #[rstest]
    #[case::object_success(
        json!({"details": {"backup": {"snapshotName": "snap", "status": "success"}}}),
        SnapshotStatus::Completed
    )]
    #[case::list_success(
        json!({"details": {"backup": ["startTime", "x", "snapshotName", "snap", "status", "success"]}}),
        SnapshotStatus::Completed
    )]
    #[case::other_snapshot(
        json!({"details": {"backup": {"snapshotName": "older", "status": "success"}}}),
        SnapshotStatus::InProgress
    )]
    #[case::no_backup_yet(json!({"details": {}}), SnapshotStatus::InProgress)]
    #[case::failed(
        json!({"details": {"backup": {"snapshotName": "snap", "status": "failed", "exception": "disk full"}}}),
        SnapshotStatus::Failed { message: "disk full".to_owned() }
    )]
    fn interprets_backup_details(#[case] details: Value, #[case] expected: SnapshotStatus) {
        assert_eq!(parse_backup_details(&details, "snap"), expected);
    }

    #[rstest]
    #[case(r#"{"error": {"msg": "boom"}}"#, "boom")]
    #[case("  plain text  ", "plain text")]
    fn extracts_error_messages(#[case] body: &str, #[case] expected: &str) {
        assert_eq!(error_message(body), expected);
    }
}
