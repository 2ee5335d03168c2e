//! Instance lifecycle against the provider.
//!
//! The instance manager:
//! - Builds launch parameters and allocates the instance (on-demand or spot)
//! - Registers it with load balancers and waits for it to run
//! - Terminates it best-effort when anything after allocation fails
//! - Tears instances down, including their registry settings

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stratus_id::InstanceId;
use stratus_reconcile::{retry_on, ProviderError, ProviderErrorKind};
use tracing::{debug, info, warn};

use crate::availability_zone::AvailabilityZoneSelector;
use crate::config::CloudOptions;
use crate::error::{CloudError, Result};
use crate::launch::{resolve_group_ids, vpc_parameters, LaunchSpec, VmRequest};
use crate::provider::CloudProvider;
use crate::registry::SettingsRegistry;
use crate::resources::{Instance, InstanceState};
use crate::spot;
use crate::wait::ResourceWait;

/// Errors worth retrying an on-demand create for.
const CREATE_RETRYABLE: &[ProviderErrorKind] = &[
    ProviderErrorKind::PrivateIpInUse,
    ProviderErrorKind::RateLimited,
];

/// Tag value marking an instance whose termination was not awaited.
pub const DELETE_MARKER: &str = "to be deleted";

/// Instance manager.
pub struct InstanceManager {
    provider: Arc<dyn CloudProvider>,
    registry: Arc<dyn SettingsRegistry>,
    zones: Arc<dyn AvailabilityZoneSelector>,
    waits: ResourceWait,
    options: CloudOptions,
}

impl InstanceManager {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        registry: Arc<dyn SettingsRegistry>,
        zones: Arc<dyn AvailabilityZoneSelector>,
        options: CloudOptions,
    ) -> Self {
        Self {
            waits: ResourceWait::new(options.waits.clone()),
            provider,
            registry,
            zones,
            options,
        }
    }

    /// Allocate an instance and wait until it is running.
    ///
    /// Once an instance exists, any later failure terminates it and returns
    /// the failure that triggered the termination.
    pub async fn create(&self, request: &VmRequest) -> Result<Instance> {
        let availability_zone = self.resolve_availability_zone(request).await?;
        let spec = LaunchSpec::build(
            request,
            &self.options,
            self.registry.endpoint(),
            availability_zone,
        )?;
        debug!(
            security_groups = ?spec.security_groups,
            availability_zone = ?spec.availability_zone,
            "Built launch spec"
        );

        let instance = match spec.spot_bid_price {
            Some(price) => self.create_spot(&spec, price).await?,
            None => self.create_on_demand(&spec).await?,
        };
        info!(instance_id = %instance.instance_id(), "Created instance");

        if let Err(err) = self.finish_create(&instance, &spec).await {
            self.compensate(instance.instance_id()).await;
            return Err(err);
        }

        Ok(instance)
    }

    async fn resolve_availability_zone(&self, request: &VmRequest) -> Result<Option<String>> {
        let mut volume_zones = Vec::with_capacity(request.disk_locality.len());
        for volume_id in &request.disk_locality {
            match self.provider.describe_volume(volume_id).await {
                Ok(volume) => volume_zones.push(volume.availability_zone),
                Err(err) if err.is_not_found() => {
                    return Err(CloudError::DiskNotFound(volume_id.to_string()))
                }
                Err(err) => return Err(err.into()),
            }
        }

        let (subnet_id, _) = vpc_parameters(&request.networks)?;
        let default = match &subnet_id {
            Some(subnet_id) => self.provider.describe_subnet(subnet_id).await?.availability_zone,
            None => self.options.default_availability_zone.clone(),
        };

        self.zones.common_availability_zone(
            &volume_zones,
            request.resource_pool.availability_zone.as_deref(),
            default.as_deref(),
        )
    }

    async fn create_on_demand(&self, spec: &LaunchSpec) -> Result<Instance> {
        let request = spec.to_instance_request();
        let policy = self.options.instance_create_retry();

        let id = retry_on(CREATE_RETRYABLE, &policy, "create instance", || {
            self.provider.run_instance(&request)
        })
        .await?;

        Ok(Instance::new(id, Arc::clone(&self.provider)))
    }

    async fn create_spot(&self, spec: &LaunchSpec, price: f64) -> Result<Instance> {
        let groups = self.provider.security_groups().await?;
        let group_ids = resolve_group_ids(&spec.security_groups, &groups)?;
        let budget = Duration::from_secs(self.options.spot.wait_secs);
        let valid_until =
            Utc::now() + chrono::Duration::from_std(budget).unwrap_or(chrono::Duration::zero());

        let request = spec.to_spot_request(price, group_ids, valid_until);
        spot::acquire(&self.provider, &self.options.spot, &request).await
    }

    async fn finish_create(&self, instance: &Instance, spec: &LaunchSpec) -> Result<()> {
        self.attach_to_load_balancers(instance.instance_id(), &spec.load_balancers)
            .await?;
        self.waits
            .for_instance(instance, InstanceState::Running)
            .await
    }

    /// Best-effort termination after a failed create. Never fails.
    pub(crate) async fn compensate(&self, id: &InstanceId) {
        warn!(instance_id = %id, "Terminating instance after failed create");
        if let Err(err) = self.provider.terminate_instance(id).await {
            warn!(instance_id = %id, error = %err, "Failed to terminate instance");
        }
    }

    /// Handle for an existing instance.
    pub async fn find_instance(&self, id: &InstanceId) -> Result<Instance> {
        self.provider
            .describe_instance(id)
            .await
            .map_err(|err| vm_not_found(id, err))?;
        Ok(Instance::new(id.clone(), Arc::clone(&self.provider)))
    }

    /// Whether the instance exists and is not terminated.
    pub async fn has_instance(&self, id: &InstanceId) -> Result<bool> {
        match self.provider.describe_instance(id).await {
            Ok(info) => Ok(InstanceState::from_provider(&info.state) != InstanceState::Terminated),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Terminate an instance and drop its registry settings.
    ///
    /// Settings are deleted even when the instance is already gone, in which
    /// case `VmNotFound` is returned afterwards. With `fast` the instance is
    /// tagged for deletion instead of waiting for termination.
    pub async fn terminate(&self, id: &InstanceId, fast: bool) -> Result<()> {
        let instance = Instance::new(id.clone(), Arc::clone(&self.provider));

        match self.remove_from_load_balancers(id).await {
            Err(CloudError::Provider(err)) if err.is_not_found() => {}
            other => other?,
        }

        info!(instance_id = %id, "Terminating instance");
        let terminated = self
            .provider
            .terminate_instance(id)
            .await
            .map_err(|err| vm_not_found(id, err));

        info!(instance_id = %id, "Deleting instance settings");
        self.registry.delete_settings(id.as_str()).await?;
        terminated?;

        if fast {
            if let Err(err) = self.provider.create_tag(id.as_str(), "Name", DELETE_MARKER).await {
                warn!(instance_id = %id, error = %err, "Could not tag instance");
            }
            info!(instance_id = %id, "Instance marked for deletion");
            return Ok(());
        }

        self.waits
            .for_instance(&instance, InstanceState::Terminated)
            .await
    }

    pub async fn reboot(&self, id: &InstanceId) -> Result<()> {
        info!(instance_id = %id, "Rebooting instance");
        self.provider
            .reboot_instance(id)
            .await
            .map_err(|err| vm_not_found(id, err))
    }

    pub async fn attach_to_load_balancers(
        &self,
        id: &InstanceId,
        load_balancers: &[String],
    ) -> Result<()> {
        for load_balancer in load_balancers {
            info!(instance_id = %id, load_balancer = %load_balancer, "Registering with load balancer");
            self.provider
                .register_with_load_balancer(load_balancer, id)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_from_load_balancers(&self, id: &InstanceId) -> Result<()> {
        for load_balancer in self.provider.load_balancers_for_instance(id).await? {
            info!(instance_id = %id, load_balancer = %load_balancer, "Removing from load balancer");
            self.provider
                .deregister_from_load_balancer(&load_balancer, id)
                .await?;
        }
        Ok(())
    }
}

fn vm_not_found(id: &InstanceId, err: ProviderError) -> CloudError {
    if err.is_not_found() {
        CloudError::VmNotFound(id.to_string())
    } else {
        err.into()
    }
}
