use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;

use super::RunTracker;
use crate::{Result, TrainErr};

#[derive(Debug, Serialize)]
struct MetricEntry<'a> {
    key: &'a str,
    value: f32,
    timestamp: i64,
    step: usize,
}

#[derive(Debug, Serialize)]
struct ParamEntry<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct Run {
    info: RunInfo,
    #[serde(default)]
    data: RunData,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct RunData {
    #[serde(default)]
    metrics: Vec<Metric>,
}

#[derive(Debug, Deserialize)]
struct Metric {
    key: String,
    value: f32,
}

/// Client of an MLflow tracking server's REST api.
pub struct MlflowTracker {
    client: reqwest::Client,
    api: String,
    experiment_id: String,
    credentials: Option<(String, String)>,
    run_id: Option<String>,
    in_flight: JoinSet<Result<()>>,
}

impl MlflowTracker {
    /// Creates a new `MlflowTracker`.
    ///
    /// # Arguments
    /// * `tracking_uri` - Base URI of the tracking server.
    /// * `experiment_id` - The experiment new runs are created in.
    /// * `credentials` - Basic auth user and password, if the server requires them.
    pub fn new(
        tracking_uri: &str,
        experiment_id: &str,
        credentials: Option<(String, String)>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api: format!("{}/api/2.0/mlflow", tracking_uri.trim_end_matches('/')),
            experiment_id: experiment_id.to_string(),
            credentials,
            run_id: None,
            in_flight: JoinSet::new(),
        }
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}/{endpoint}", self.api));
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    fn active_run(&self) -> Result<&str> {
        self.run_id
            .as_deref()
            .ok_or_else(|| TrainErr::InvalidConfig("no active tracking run".into()))
    }
}

/// Sends `request`, turning non success statuses into errors.
async fn send(operation: &'static str, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TrainErr::Tracker {
            operation,
            status: status.as_u16(),
            body,
        });
    }

    Ok(response)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RunTracker for MlflowTracker {
    async fn start_run(&mut self, run_id: Option<String>) -> Result<String> {
        let run_id = match run_id {
            Some(run_id) => {
                let body = json!({ "run_id": run_id, "status": "RUNNING" });
                send("runs/update", self.request(reqwest::Method::POST, "runs/update").json(&body))
                    .await?;
                run_id
            }
            None => {
                let body = json!({
                    "experiment_id": self.experiment_id,
                    "start_time": now_millis(),
                });
                let request = self.request(reqwest::Method::POST, "runs/create").json(&body);
                let created: RunResponse = send("runs/create", request).await?.json().await?;
                created.run.info.run_id
            }
        };

        info!("tracking run {run_id}");
        self.run_id = Some(run_id.clone());
        Ok(run_id)
    }

    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<()> {
        let params: Vec<_> = params
            .iter()
            .map(|(key, value)| ParamEntry { key, value })
            .collect();
        let body = json!({ "run_id": self.active_run()?, "params": params });

        send("runs/log-batch", self.request(reqwest::Method::POST, "runs/log-batch").json(&body))
            .await?;
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &BTreeMap<String, f32>, step: usize) -> Result<()> {
        let timestamp = now_millis();
        let metrics: Vec<_> = metrics
            .iter()
            .map(|(key, &value)| MetricEntry {
                key,
                value,
                timestamp,
                step,
            })
            .collect();
        let body = json!({ "run_id": self.active_run()?, "metrics": metrics });
        let request = self.request(reqwest::Method::POST, "runs/log-batch").json(&body);

        self.in_flight.spawn(async move {
            send("runs/log-batch", request).await?;
            Ok(())
        });
        Ok(())
    }

    async fn get_run_metrics(&mut self, run_id: &str) -> Result<BTreeMap<String, f32>> {
        let request = self
            .request(reqwest::Method::GET, "runs/get")
            .query(&[("run_id", run_id)]);
        let run: RunResponse = send("runs/get", request).await?.json().await?;

        debug!("fetched metrics of run {}", run.run.info.run_id);
        Ok(run
            .run
            .data
            .metrics
            .into_iter()
            .map(|metric| (metric.key, metric.value))
            .collect())
    }

    async fn finish(&mut self) -> Result<()> {
        let mut failed = None;
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined.map_err(TrainErr::from).and_then(|report| report) {
                warn!("metrics report failed: {e}");
                failed.get_or_insert(e);
            }
        }

        if let Some(e) = failed {
            return Err(e);
        }

        let Some(run_id) = self.run_id.take() else {
            return Ok(());
        };

        let body = json!({ "run_id": run_id, "status": "FINISHED", "end_time": now_millis() });
        send("runs/update", self.request(reqwest::Method::POST, "runs/update").json(&body)).await?;
        info!("finished tracking run {run_id}");
        Ok(())
    }
}
