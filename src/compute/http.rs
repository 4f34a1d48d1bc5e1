//! Blocking REST client for the Compute Engine v1 API.
//!
//! Requests are authenticated with a bearer access token obtained once at
//! startup (see [`crate::auth`]). The client is synchronous on purpose: each
//! pipeline step blocks until the remote side confirms completion anyway.

use crate::compute::types::*;
use crate::compute::ComputeApi;
use crate::error::{RescueError, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Public Compute Engine endpoint
pub const DEFAULT_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";

const USER_AGENT: &str = concat!("gce-rescue/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout. Operations are polled, so no single call is slow.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// REST implementation of [`ComputeApi`].
pub struct ComputeClient {
    http: Client,
    endpoint: String,
    token: String,
}

#[derive(Deserialize)]
struct DiskList {
    #[serde(default)]
    items: Vec<Disk>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorPayload,
}

#[derive(Deserialize)]
struct ApiErrorPayload {
    #[serde(default)]
    message: String,
}

impl ComputeClient {
    /// Create a client against the public endpoint.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT, token)
    }

    /// Create a client against a custom endpoint (private service connect, tests).
    pub fn with_endpoint(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn zone_url(&self, loc: &Location, path: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{}",
            self.endpoint, loc.project, loc.zone, path
        )
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.token).send()?;
        let response = check_status(response)?;
        Ok(response.json()?)
    }

    fn get<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        debug!("GET {}", url);
        self.send(self.http.get(url))
    }

    fn post<T: DeserializeOwned>(&self, url: String, body: &impl serde::Serialize) -> Result<T> {
        debug!("POST {}", url);
        self.send(self.http.post(url).json(body))
    }
}

/// Map non-success responses onto the error taxonomy.
fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|parsed| parsed.error.message)
        .unwrap_or(body);

    if status == StatusCode::NOT_FOUND {
        Err(RescueError::NotFound(format!("{} ({})", url, message)))
    } else {
        Err(RescueError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

impl ComputeApi for ComputeClient {
    fn get_instance(&self, loc: &Location, instance: &str) -> Result<Instance> {
        self.get(self.zone_url(loc, &format!("instances/{}", instance)))
    }

    fn start_instance(&self, loc: &Location, instance: &str) -> Result<Operation> {
        self.post(
            self.zone_url(loc, &format!("instances/{}/start", instance)),
            &serde_json::json!({}),
        )
    }

    fn stop_instance(&self, loc: &Location, instance: &str) -> Result<Operation> {
        self.post(
            self.zone_url(loc, &format!("instances/{}/stop", instance)),
            &serde_json::json!({}),
        )
    }

    fn attach_disk(
        &self,
        loc: &Location,
        instance: &str,
        request: &AttachDiskRequest,
    ) -> Result<Operation> {
        self.post(
            self.zone_url(loc, &format!("instances/{}/attachDisk", instance)),
            request,
        )
    }

    fn detach_disk(
        &self,
        loc: &Location,
        instance: &str,
        device_name: &str,
    ) -> Result<Operation> {
        let url = self.zone_url(loc, &format!("instances/{}/detachDisk", instance));
        debug!("POST {} deviceName={}", url, device_name);
        self.send(
            self.http
                .post(url)
                .query(&[("deviceName", device_name)])
                .json(&serde_json::json!({})),
        )
    }

    fn set_metadata(
        &self,
        loc: &Location,
        instance: &str,
        metadata: &Metadata,
    ) -> Result<Operation> {
        self.post(
            self.zone_url(loc, &format!("instances/{}/setMetadata", instance)),
            metadata,
        )
    }

    fn get_serial_port_output(&self, loc: &Location, instance: &str) -> Result<SerialPortOutput> {
        self.get(self.zone_url(loc, &format!("instances/{}/serialPort", instance)))
    }

    fn get_disk(&self, loc: &Location, disk: &str) -> Result<Disk> {
        self.get(self.zone_url(loc, &format!("disks/{}", disk)))
    }

    fn insert_disk(&self, loc: &Location, disk: &DiskInsert) -> Result<Operation> {
        self.post(self.zone_url(loc, "disks"), disk)
    }

    fn delete_disk(&self, loc: &Location, disk: &str) -> Result<Operation> {
        let url = self.zone_url(loc, &format!("disks/{}", disk));
        debug!("DELETE {}", url);
        self.send(self.http.delete(url))
    }

    fn list_disks(&self, loc: &Location, filter: &str) -> Result<Vec<Disk>> {
        let url = self.zone_url(loc, "disks");
        let mut disks = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            debug!("GET {} filter={} page={:?}", url, filter, page_token);
            let mut request = self.http.get(&url).query(&[("filter", filter)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: DiskList = self.send(request)?;
            disks.extend(page.items);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(disks)
    }

    fn set_disk_labels(
        &self,
        loc: &Location,
        disk: &str,
        request: &SetLabelsRequest,
    ) -> Result<Operation> {
        self.post(
            self.zone_url(loc, &format!("disks/{}/setLabels", disk)),
            request,
        )
    }

    fn create_snapshot(
        &self,
        loc: &Location,
        disk: &str,
        snapshot_name: &str,
    ) -> Result<Operation> {
        self.post(
            self.zone_url(loc, &format!("disks/{}/createSnapshot", disk)),
            &serde_json::json!({ "name": snapshot_name }),
        )
    }

    fn get_zone_operation(&self, loc: &Location, operation: &str) -> Result<Operation> {
        self.get(self.zone_url(loc, &format!("operations/{}", operation)))
    }
}
