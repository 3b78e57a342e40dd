use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{remaining_agents_healthy, ClusterControl, ClusterHealth, JobStatus, MemberHealth};
use crate::error::{OperatorError, Result};
use crate::member::ServerGroup;

/// Cluster administration client over HTTP.
pub struct HttpClusterControl {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(rename = "Health", default)]
    health: HashMap<String, HealthEntry>,
}

#[derive(Deserialize)]
struct HealthEntry {
    #[serde(rename = "Role", default)]
    role: String,
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Serialize)]
struct CleanOutRequest<'a> {
    server: &'a str,
}

#[derive(Deserialize)]
struct JobResponse {
    id: String,
}

#[derive(Deserialize)]
struct JobStatusResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ServersResponse {
    #[serde(rename = "cleanedServers", default)]
    cleaned_servers: Vec<String>,
}

impl HttpClusterControl {
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("dbcluster-operator/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/_admin/cluster{}", self.endpoint, path)
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref token) = self.token {
            req.bearer_auth(token)
        } else {
            req
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let req = self.add_auth(self.client.get(self.url(path)).query(query));
        let resp = req.send().await?;
        Self::handle_response(resp).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let req = self.add_auth(self.client.post(self.url(path)).json(body));
        let resp = req.send().await?;
        Self::handle_response(resp).await
    }

    async fn handle_response<T: DeserializeOwned>(resp: Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OperatorError::Cluster(format!(
                "request failed with status {}: {}",
                status, body
            )));
        }
        Ok(resp.json().await?)
    }
}

fn parse_job_status(resp: JobStatusResponse) -> Result<JobStatus> {
    match resp.status.as_str() {
        "ToDo" | "Pending" => Ok(JobStatus::Pending),
        "Finished" => Ok(JobStatus::Succeeded),
        "Failed" => Ok(JobStatus::Failed {
            reason: resp.reason.unwrap_or_else(|| "cleanout job failed".to_string()),
        }),
        other => Err(OperatorError::Cluster(format!("unknown job status {:?}", other))),
    }
}

#[async_trait]
impl ClusterControl for HttpClusterControl {
    async fn health(&self) -> Result<ClusterHealth> {
        let resp: HealthResponse = self.get("/health", &[]).await?;
        let members = resp
            .health
            .into_iter()
            .map(|(id, entry)| {
                let group = ServerGroup::from_role(&entry.role.to_lowercase());
                (
                    id,
                    MemberHealth {
                        group,
                        alive: entry.status == "GOOD",
                    },
                )
            })
            .collect();
        Ok(ClusterHealth { members })
    }

    async fn clean_out_server(&self, member_id: &str) -> Result<String> {
        let resp: JobResponse = self
            .post("/cleanOutServer", &CleanOutRequest { server: member_id })
            .await?;
        debug!(member = %member_id, job = %resp.id, "Cleanout job created");
        Ok(resp.id)
    }

    async fn cleanout_job_status(&self, job_id: &str) -> Result<JobStatus> {
        let resp: JobStatusResponse = self.get("/queryAgencyJob", &[("id", job_id)]).await?;
        parse_job_status(resp)
    }

    async fn is_cleaned_out(&self, member_id: &str) -> Result<bool> {
        let resp: ServersResponse = self.get("/numberOfServers", &[]).await?;
        Ok(resp.cleaned_servers.iter().any(|s| s == member_id))
    }

    async fn agency_healthy(&self, exclude: &str) -> Result<()> {
        let health = self.health().await?;
        remaining_agents_healthy(&health, exclude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_status() {
        let parse = |json: &str| parse_job_status(serde_json::from_str(json).unwrap());

        assert_eq!(parse(r#"{"status":"ToDo"}"#).unwrap(), JobStatus::Pending);
        assert_eq!(parse(r#"{"status":"Finished"}"#).unwrap(), JobStatus::Succeeded);
        assert_eq!(
            parse(r#"{"status":"Failed","reason":"no space"}"#).unwrap(),
            JobStatus::Failed {
                reason: "no space".to_string()
            }
        );
        assert!(parse(r#"{"status":"Exploded"}"#).is_err());
    }

    #[test]
    fn test_health_response_shape() {
        let resp: HealthResponse = serde_json::from_str(
            r#"{"Health":{"AGNT-1":{"Role":"Agent","Status":"GOOD"},"PRMR-1":{"Role":"DBServer","Status":"FAILED"}}}"#,
        )
        .unwrap();
        assert_eq!(resp.health.len(), 2);
        assert_eq!(resp.health["PRMR-1"].status, "FAILED");
    }
}
