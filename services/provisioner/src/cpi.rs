//! External CPI protocol.
//!
//! One JSON request in, one JSON response out:
//!
//! ```text
//! {"method": "create_disk", "arguments": [2048, {}, "i-0000000a"], "context": {...}}
//! {"result": "vol-0000000b", "error": null, "log": ""}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::cloud::{Cloud, StemcellProperties};
use crate::error::CloudError;
use crate::launch::{NetworkSpecs, ResourcePool};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    pub method: String,

    #[serde(default)]
    pub arguments: Vec<Value>,

    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub result: Value,
    pub error: Option<ResponseError>,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub ok_to_retry: bool,
}

impl Response {
    fn ok(result: Value) -> Self {
        Self {
            result,
            error: None,
            log: String::new(),
        }
    }

    fn failed(err: &CpiError) -> Self {
        Self {
            result: Value::Null,
            error: Some(ResponseError {
                error_type: err.cpi_type().to_string(),
                message: err.to_string(),
                ok_to_retry: err.ok_to_retry(),
            }),
            log: String::new(),
        }
    }
}

/// Protocol-level failures.
#[derive(Debug, Error)]
pub enum CpiError {
    #[error("method `{0}' is not implemented")]
    NotImplemented(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid arguments for `{method}': {reason}")]
    BadArguments { method: String, reason: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl CpiError {
    pub fn cpi_type(&self) -> &'static str {
        match self {
            Self::NotImplemented(_) => "Bosh::Clouds::NotImplemented",
            Self::Cloud(err) => err.cpi_type(),
            Self::InvalidRequest(_) | Self::BadArguments { .. } => "Bosh::Clouds::CloudError",
        }
    }

    pub fn ok_to_retry(&self) -> bool {
        matches!(self, Self::Cloud(err) if err.ok_to_retry())
    }
}

/// Decode a raw request and run it.
pub async fn handle_raw(cloud: &Cloud, raw: &str) -> Response {
    match serde_json::from_str::<Request>(raw) {
        Ok(request) => handle(cloud, &request).await,
        Err(err) => Response::failed(&CpiError::InvalidRequest(err.to_string())),
    }
}

/// Run one request.
pub async fn handle(cloud: &Cloud, request: &Request) -> Response {
    info!(
        method = %request.method,
        arguments = request.arguments.len(),
        request_id = ?request.context.get("request_id"),
        "Handling CPI request"
    );

    match dispatch(cloud, request).await {
        Ok(result) => Response::ok(result),
        Err(err) => {
            error!(method = %request.method, error = %err, "CPI request failed");
            Response::failed(&err)
        }
    }
}

async fn dispatch(cloud: &Cloud, request: &Request) -> Result<Value, CpiError> {
    let args = Args {
        method: &request.method,
        values: &request.arguments,
    };

    match request.method.as_str() {
        "create_vm" => {
            let disk_locality: Vec<String> = args.optional(4)?.unwrap_or_default();
            let id = cloud
                .create_vm(
                    args.string(0)?,
                    args.string(1)?,
                    args.parse::<ResourcePool>(2)?,
                    args.parse::<NetworkSpecs>(3)?,
                    &disk_locality,
                    args.optional::<Value>(5)?,
                )
                .await?;
            Ok(Value::String(id.to_string()))
        }
        "delete_vm" => {
            cloud.delete_vm(args.string(0)?).await?;
            Ok(Value::Null)
        }
        "has_vm" => Ok(Value::Bool(cloud.has_vm(args.string(0)?).await?)),
        "reboot_vm" => {
            cloud.reboot_vm(args.string(0)?).await?;
            Ok(Value::Null)
        }
        "set_vm_metadata" => {
            let metadata: Map<String, Value> = args.parse(1)?;
            cloud.set_vm_metadata(args.string(0)?, &metadata).await?;
            Ok(Value::Null)
        }
        "configure_networks" => {
            cloud
                .configure_networks(args.string(0)?, args.parse(1)?)
                .await?;
            Ok(Value::Null)
        }
        "create_disk" => {
            let size = args.u64(0)?;
            let instance_id = args
                .values
                .iter()
                .skip(1)
                .rev()
                .find_map(Value::as_str);
            let id = cloud.create_disk(size, instance_id).await?;
            Ok(Value::String(id.to_string()))
        }
        "delete_disk" => {
            cloud.delete_disk(args.string(0)?).await?;
            Ok(Value::Null)
        }
        "attach_disk" => {
            cloud
                .attach_disk(args.string(0)?, args.string(1)?)
                .await?;
            Ok(Value::Null)
        }
        "detach_disk" => {
            cloud
                .detach_disk(args.string(0)?, args.string(1)?)
                .await?;
            Ok(Value::Null)
        }
        "snapshot_disk" => {
            let metadata: Map<String, Value> = args.optional(1)?.unwrap_or_default();
            let id = cloud.snapshot_disk(args.string(0)?, &metadata).await?;
            Ok(Value::String(id.to_string()))
        }
        "delete_snapshot" => {
            cloud.delete_snapshot(args.string(0)?).await?;
            Ok(Value::Null)
        }
        "create_stemcell" => create_stemcell(cloud, &args).await,
        "delete_stemcell" => {
            cloud.delete_stemcell(args.string(0)?).await?;
            Ok(Value::Null)
        }
        other => Err(CpiError::NotImplemented(other.to_string())),
    }
}

/// Light stemcells name an existing image; otherwise an image is registered
/// from a snapshot. Uploading image files is not supported.
async fn create_stemcell(cloud: &Cloud, args: &Args<'_>) -> Result<Value, CpiError> {
    let properties: Map<String, Value> = args.optional(1)?.unwrap_or_default();

    if let Some(image) = properties.get("ami").and_then(Value::as_str) {
        let image = stratus_id::ImageId::parse(image).map_err(CloudError::from)?;
        return Ok(Value::String(image.to_string()));
    }

    if let Some(snapshot_id) = properties.get("snapshot_id").and_then(Value::as_str) {
        let stemcell: StemcellProperties =
            serde_json::from_value(Value::Object(properties.clone())).map_err(|err| {
                CpiError::BadArguments {
                    method: args.method.to_string(),
                    reason: err.to_string(),
                }
            })?;
        let id = cloud
            .create_stemcell_from_snapshot(snapshot_id, &stemcell)
            .await?;
        return Ok(Value::String(id.to_string()));
    }

    Err(CloudError::NotSupported(
        "creating a stemcell from an image file is not supported".to_string(),
    )
    .into())
}

struct Args<'a> {
    method: &'a str,
    values: &'a [Value],
}

impl Args<'_> {
    fn bad(&self, reason: impl Into<String>) -> CpiError {
        CpiError::BadArguments {
            method: self.method.to_string(),
            reason: reason.into(),
        }
    }

    fn string(&self, index: usize) -> Result<&str, CpiError> {
        self.values
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| self.bad(format!("argument {index} must be a string")))
    }

    fn u64(&self, index: usize) -> Result<u64, CpiError> {
        self.values
            .get(index)
            .and_then(Value::as_u64)
            .ok_or_else(|| self.bad(format!("argument {index} must be a positive integer")))
    }

    fn parse<T: DeserializeOwned>(&self, index: usize) -> Result<T, CpiError> {
        match self.optional(index)? {
            Some(value) => Ok(value),
            None => Err(self.bad(format!("argument {index} is required"))),
        }
    }

    /// `None` for a missing or null argument.
    fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, CpiError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| self.bad(format!("argument {index}: {err}"))),
        }
    }
}
