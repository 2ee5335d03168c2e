//! Spot capacity acquisition.
//!
//! The request is submitted once and then polled on a fixed schedule until
//! it is fulfilled, rejected or the wait budget runs out. The budget is a
//! wall-clock deadline covering the inner describe retries too. Every exit
//! other than success or a failed submission cancels the request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stratus_id::{InstanceId, SpotRequestId};
use stratus_reconcile::{
    retry_on, wait_for, BackoffPolicy, ConvergeError, Observable, ProviderError,
    ProviderErrorKind, ResourceKind, TerminalStates,
};
use tracing::{info, warn};

use crate::config::SpotOptions;
use crate::error::{CloudError, Result};
use crate::provider::{CloudProvider, SpotInstanceRequest};
use crate::resources::{Instance, SpotRequestState};

const PRICE_TOO_LOW: &str = "price-too-low";

/// Submit `request` and wait for it to be fulfilled.
pub async fn acquire(
    provider: &Arc<dyn CloudProvider>,
    options: &SpotOptions,
    request: &SpotInstanceRequest,
) -> Result<Instance> {
    let id = provider
        .request_spot_instance(request)
        .await
        .map_err(|err| {
            CloudError::vm_creation_failed(
                format!("spot instance request failed: {}", err.message()),
                false,
            )
        })?;

    info!(
        spot_request_id = %id,
        price = %request.spot_price,
        "Spot instance requested"
    );

    let spot = SpotRequest {
        id: id.clone(),
        provider: Arc::clone(provider),
        describe_policy: options.describe_policy(),
        instance_id: Mutex::new(None),
    };
    let states = TerminalStates::target(SpotRequestState::Active)
        .fatal(SpotRequestState::PriceTooLow)
        .fatal(SpotRequestState::Failed)
        .fatal(SpotRequestState::Closed)
        .fatal(SpotRequestState::Cancelled)
        .tolerate(ProviderErrorKind::NotFound);

    let budget = Duration::from_secs(options.wait_secs);
    let outcome = tokio::time::timeout(budget, wait_for(&spot, &states, &options.poll_policy()))
        .await
        .unwrap_or_else(|_| {
            warn!(spot_request_id = %id, "Spot wait budget exhausted");
            Err(ConvergeError::Timeout {
                resource: spot.describe(),
                attempts: 0,
                elapsed: budget,
                last_observed: None,
            })
        });

    match outcome {
        Ok(_) => match spot.fulfilled_by() {
            Some(instance_id) => {
                info!(spot_request_id = %id, instance_id = %instance_id, "Spot request fulfilled");
                Ok(Instance::new(instance_id, Arc::clone(provider)))
            }
            None => {
                cancel(provider.as_ref(), &id).await;
                Err(CloudError::vm_creation_failed(
                    format!("spot instance request {id} is active without an instance"),
                    false,
                ))
            }
        },
        Err(ConvergeError::Timeout { .. }) => {
            cancel(provider.as_ref(), &id).await;
            Err(CloudError::vm_creation_failed(
                format!(
                    "spot instance request {id} was not fulfilled within {} seconds",
                    options.wait_secs
                ),
                true,
            ))
        }
        Err(err) => {
            cancel(provider.as_ref(), &id).await;
            Err(CloudError::vm_creation_failed(
                format!("spot instance request rejected: {err}"),
                false,
            ))
        }
    }
}

async fn cancel(provider: &dyn CloudProvider, id: &SpotRequestId) {
    info!(spot_request_id = %id, "Cancelling spot request");
    if let Err(err) = provider.cancel_spot_request(id).await {
        warn!(spot_request_id = %id, error = %err, "Failed to cancel spot request");
    }
}

/// A submitted spot request, observed through a short describe retry.
struct SpotRequest {
    id: SpotRequestId,
    provider: Arc<dyn CloudProvider>,
    describe_policy: BackoffPolicy,
    instance_id: Mutex<Option<InstanceId>>,
}

impl SpotRequest {
    fn fulfilled_by(&self) -> Option<InstanceId> {
        self.instance_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Observable for SpotRequest {
    type State = SpotRequestState;

    fn kind(&self) -> ResourceKind {
        ResourceKind::SpotRequest
    }

    fn id(&self) -> &str {
        self.id.as_str()
    }

    async fn state(&self) -> std::result::Result<SpotRequestState, ProviderError> {
        let info = retry_on(
            &[ProviderErrorKind::NotFound],
            &self.describe_policy,
            "describe spot request",
            || self.provider.describe_spot_request(&self.id),
        )
        .await?;

        if info.status_code.as_deref() == Some(PRICE_TOO_LOW) {
            return Ok(SpotRequestState::PriceTooLow);
        }

        let state = SpotRequestState::from_provider(&info.state);
        if state != SpotRequestState::Active {
            return Ok(state);
        }

        match info.instance_id {
            Some(instance_id) => {
                *self
                    .instance_id
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(instance_id);
                Ok(SpotRequestState::Active)
            }
            None => Ok(SpotRequestState::Open),
        }
    }
}
