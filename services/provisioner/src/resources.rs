//! Resource handles and their provider state enums.
//!
//! A handle is the id plus the provider it lives in. It is cheap to clone and
//! read-only; every [`Observable::state`] call is one describe request.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use stratus_id::{ImageId, InstanceId, SnapshotId, SubnetId, VolumeId};
use stratus_reconcile::{define_state, Observable, ProviderError, ResourceKind};

use crate::provider::CloudProvider;

define_state!(
    /// Instance lifecycle.
    InstanceState {
        Pending => "pending",
        Running => "running",
        ShuttingDown => "shutting-down",
        Terminated => "terminated",
        Stopping => "stopping",
        Stopped => "stopped",
    }
);

define_state!(VolumeState {
    Creating => "creating",
    Available => "available",
    InUse => "in-use",
    Deleting => "deleting",
    Deleted => "deleted",
    Error => "error",
});

define_state!(SnapshotState {
    Pending => "pending",
    Completed => "completed",
    Error => "error",
    Deleted => "deleted",
});

define_state!(ImageState {
    Pending => "pending",
    Available => "available",
    Failed => "failed",
    Deregistered => "deregistered",
});

define_state!(SubnetState {
    Pending => "pending",
    Available => "available",
});

define_state!(AttachmentState {
    Attaching => "attaching",
    Attached => "attached",
    Detaching => "detaching",
    Detached => "detached",
});

define_state!(
    /// Spot request lifecycle. `PriceTooLow` is derived from the status code.
    SpotRequestState {
        Open => "open",
        Active => "active",
        Closed => "closed",
        Cancelled => "cancelled",
        Failed => "failed",
        PriceTooLow => "price-too-low",
    }
);

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $id:ty, $accessor:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            id: $id,
            provider: Arc<dyn CloudProvider>,
        }

        impl $name {
            pub fn new(id: $id, provider: Arc<dyn CloudProvider>) -> Self {
                Self { id, provider }
            }

            pub fn $accessor(&self) -> &$id {
                &self.id
            }

            pub fn provider(&self) -> &Arc<dyn CloudProvider> {
                &self.provider
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name)).field("id", &self.id).finish()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }
    };
}

handle!(
    /// A provider instance.
    Instance,
    InstanceId,
    instance_id
);
handle!(Volume, VolumeId, volume_id);
handle!(Snapshot, SnapshotId, snapshot_id);
handle!(Image, ImageId, image_id);
handle!(Subnet, SubnetId, subnet_id);

#[async_trait]
impl Observable for Instance {
    type State = InstanceState;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Instance
    }

    fn id(&self) -> &str {
        self.id.as_str()
    }

    async fn state(&self) -> Result<InstanceState, ProviderError> {
        let info = self.provider.describe_instance(&self.id).await?;
        Ok(InstanceState::from_provider(&info.state))
    }
}

#[async_trait]
impl Observable for Volume {
    type State = VolumeState;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Volume
    }

    fn id(&self) -> &str {
        self.id.as_str()
    }

    async fn state(&self) -> Result<VolumeState, ProviderError> {
        let info = self.provider.describe_volume(&self.id).await?;
        Ok(VolumeState::from_provider(&info.state))
    }
}

#[async_trait]
impl Observable for Snapshot {
    type State = SnapshotState;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Snapshot
    }

    fn id(&self) -> &str {
        self.id.as_str()
    }

    async fn state(&self) -> Result<SnapshotState, ProviderError> {
        let info = self.provider.describe_snapshot(&self.id).await?;
        Ok(SnapshotState::from_provider(&info.state))
    }
}

#[async_trait]
impl Observable for Image {
    type State = ImageState;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Image
    }

    fn id(&self) -> &str {
        self.id.as_str()
    }

    async fn state(&self) -> Result<ImageState, ProviderError> {
        let info = self.provider.describe_image(&self.id).await?;
        Ok(ImageState::from_provider(&info.state))
    }
}

#[async_trait]
impl Observable for Subnet {
    type State = SubnetState;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Subnet
    }

    fn id(&self) -> &str {
        self.id.as_str()
    }

    async fn state(&self) -> Result<SubnetState, ProviderError> {
        let info = self.provider.describe_subnet(&self.id).await?;
        Ok(SubnetState::from_provider(&info.state))
    }
}

/// A volume attached (or being attached) to an instance at a device.
#[derive(Clone)]
pub struct Attachment {
    volume: VolumeId,
    instance: InstanceId,
    device: String,
    key: String,
    provider: Arc<dyn CloudProvider>,
}

impl Attachment {
    pub fn new(
        volume: VolumeId,
        instance: InstanceId,
        device: impl Into<String>,
        provider: Arc<dyn CloudProvider>,
    ) -> Self {
        let key = format!("{volume}/{instance}");
        Self {
            volume,
            instance,
            device: device.into(),
            key,
            provider,
        }
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.volume
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("volume", &self.volume)
            .field("instance", &self.instance)
            .field("device", &self.device)
            .finish()
    }
}

#[async_trait]
impl Observable for Attachment {
    type State = AttachmentState;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Attachment
    }

    fn id(&self) -> &str {
        &self.key
    }

    async fn state(&self) -> Result<AttachmentState, ProviderError> {
        let raw = self
            .provider
            .attachment_state(&self.volume, &self.instance)
            .await?;
        Ok(AttachmentState::from_provider(&raw))
    }
}
