//! gRPC server implementation.
//!
//! Thin conversion layer: proto request in, [`VolumeManager`] call, proto
//! response out. All domain logic lives in the manager; this file only maps
//! messages and error codes.

use crate::proto_convert::{
    capabilities_from_proto, options_from_proto, struct_to_json, usage_to_proto, volume_to_proto,
};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};
use zsilo_api::zsilo::v1 as pb;
use zsilo_core::volumes::CreateVolumeParams;
use zsilo_core::{SiloError, VolumeManager};

/// Map a domain error onto the status code the RPC surface promises.
fn error_to_status(err: SiloError) -> Status {
    // A busy dataset is a retryable precondition failure wherever it shows up.
    if err.command_stderr().is_some_and(|stderr| stderr.contains("dataset is busy")) {
        return Status::failed_precondition(err.to_string());
    }

    let message = err.to_string();
    match err {
        SiloError::InvalidArgument(_) | SiloError::FieldType { .. } => {
            Status::invalid_argument(message)
        }
        SiloError::NotFound(_) => Status::not_found(message),
        SiloError::AlreadyExists(_) => Status::already_exists(message),
        SiloError::FailedPrecondition(_) => Status::failed_precondition(message),
        SiloError::Unauthenticated(_) => Status::unauthenticated(message),
        _ => Status::internal(message),
    }
}

/// Host-level service: pool capacity.
pub struct SiloServiceImpl {
    manager: Arc<VolumeManager>,
}

impl SiloServiceImpl {
    pub fn new(manager: Arc<VolumeManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl pb::service_server::Service for SiloServiceImpl {
    #[instrument(skip(self, _request))]
    async fn get_capacity(
        &self,
        _request: Request<pb::GetCapacityRequest>,
    ) -> Result<Response<pb::GetCapacityResponse>, Status> {
        info!("gRPC: GetCapacity");

        let available = self.manager.capacity().await.map_err(error_to_status)?;
        Ok(Response::new(pb::GetCapacityResponse { available_capacity_bytes: available }))
    }
}

/// Volume lifecycle service.
pub struct VolumeServiceImpl {
    manager: Arc<VolumeManager>,
}

impl VolumeServiceImpl {
    pub fn new(manager: Arc<VolumeManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl pb::volume_service_server::VolumeService for VolumeServiceImpl {
    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn get_volume(
        &self,
        request: Request<pb::GetVolumeRequest>,
    ) -> Result<Response<pb::GetVolumeResponse>, Status> {
        info!("gRPC: GetVolume");

        let req = request.into_inner();
        let volume = self.manager.get(&req.id).await.map_err(error_to_status)?;
        Ok(Response::new(pb::GetVolumeResponse { volume: Some(volume_to_proto(volume)) }))
    }

    #[instrument(skip(self, request))]
    async fn list_volumes(
        &self,
        request: Request<pb::ListVolumesRequest>,
    ) -> Result<Response<pb::ListVolumesResponse>, Status> {
        info!("gRPC: ListVolumes");

        let req = request.into_inner();
        let (volumes, next_page_token) = self
            .manager
            .list(req.page_size, &req.page_token)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(pb::ListVolumesResponse {
            volumes: volumes.into_iter().map(volume_to_proto).collect(),
            next_page_token,
        }))
    }

    #[instrument(skip(self, request), fields(name = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<pb::CreateVolumeRequest>,
    ) -> Result<Response<pb::CreateVolumeResponse>, Status> {
        info!("gRPC: CreateVolume");

        let req = request.into_inner();
        let capabilities = capabilities_from_proto(&req.capabilities)?;
        let capacity_range = req.capacity_range.unwrap_or_default();

        let params = CreateVolumeParams {
            name: req.name,
            parent_dataset_id: req.parent_dataset_id,
            required_bytes: capacity_range.required_bytes,
            limit_bytes: capacity_range.limit_bytes,
            capabilities,
            sparse: req.sparse,
            options: options_from_proto(req.options),
            attrs: req.r#struct.map(struct_to_json).unwrap_or(JsonValue::Null),
        };

        let volume = self.manager.create(params).await.map_err(error_to_status)?;
        Ok(Response::new(pb::CreateVolumeResponse { volume: Some(volume_to_proto(volume)) }))
    }

    #[instrument(skip(self, request))]
    async fn update_volume(
        &self,
        request: Request<pb::UpdateVolumeRequest>,
    ) -> Result<Response<pb::UpdateVolumeResponse>, Status> {
        info!("gRPC: UpdateVolume");

        let req = request.into_inner();
        let updates = match req.volume.map(struct_to_json) {
            Some(JsonValue::Object(map)) => map,
            _ => Map::new(),
        };

        let volume = self.manager.update(updates).await.map_err(error_to_status)?;
        Ok(Response::new(pb::UpdateVolumeResponse { volume: Some(volume_to_proto(volume)) }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn delete_volume(
        &self,
        request: Request<pb::DeleteVolumeRequest>,
    ) -> Result<Response<pb::DeleteVolumeResponse>, Status> {
        info!("gRPC: DeleteVolume");

        let req = request.into_inner();
        self.manager.delete(&req.id).await.map_err(error_to_status)?;
        Ok(Response::new(pb::DeleteVolumeResponse {}))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn publish_volume(
        &self,
        request: Request<pb::PublishVolumeRequest>,
    ) -> Result<Response<pb::PublishVolumeResponse>, Status> {
        info!("gRPC: PublishVolume");

        let req = request.into_inner();
        let volume = self.manager.publish(&req.id).await.map_err(error_to_status)?;
        Ok(Response::new(pb::PublishVolumeResponse { volume: Some(volume_to_proto(volume)) }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn unpublish_volume(
        &self,
        request: Request<pb::UnpublishVolumeRequest>,
    ) -> Result<Response<pb::UnpublishVolumeResponse>, Status> {
        info!("gRPC: UnpublishVolume");

        let req = request.into_inner();
        let volume = self.manager.unpublish(&req.id).await.map_err(error_to_status)?;
        Ok(Response::new(pb::UnpublishVolumeResponse { volume: Some(volume_to_proto(volume)) }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn connect_volume(
        &self,
        request: Request<pb::ConnectVolumeRequest>,
    ) -> Result<Response<pb::ConnectVolumeResponse>, Status> {
        info!("gRPC: ConnectVolume");

        let req = request.into_inner();
        let volume = self
            .manager
            .connect(&req.id, &req.initiator_iqn, &req.target_address)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(pb::ConnectVolumeResponse { volume: Some(volume_to_proto(volume)) }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn disconnect_volume(
        &self,
        request: Request<pb::DisconnectVolumeRequest>,
    ) -> Result<Response<pb::DisconnectVolumeResponse>, Status> {
        info!("gRPC: DisconnectVolume");

        let req = request.into_inner();
        let volume = self.manager.disconnect(&req.id).await.map_err(error_to_status)?;
        Ok(Response::new(pb::DisconnectVolumeResponse {
            volume: Some(volume_to_proto(volume)),
        }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn mount_volume(
        &self,
        request: Request<pb::MountVolumeRequest>,
    ) -> Result<Response<pb::MountVolumeResponse>, Status> {
        info!("gRPC: MountVolume");

        let req = request.into_inner();
        let volume =
            self.manager.mount(&req.id, &req.mount_path).await.map_err(error_to_status)?;
        Ok(Response::new(pb::MountVolumeResponse { volume: Some(volume_to_proto(volume)) }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn unmount_volume(
        &self,
        request: Request<pb::UnmountVolumeRequest>,
    ) -> Result<Response<pb::UnmountVolumeResponse>, Status> {
        info!("gRPC: UnmountVolume");

        let req = request.into_inner();
        let volume = self.manager.unmount(&req.id).await.map_err(error_to_status)?;
        Ok(Response::new(pb::UnmountVolumeResponse { volume: Some(volume_to_proto(volume)) }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn stats_volume(
        &self,
        request: Request<pb::StatsVolumeRequest>,
    ) -> Result<Response<pb::StatsVolumeResponse>, Status> {
        info!("gRPC: StatsVolume");

        let req = request.into_inner();
        let usage = self.manager.stats(&req.id).await.map_err(error_to_status)?;
        Ok(Response::new(pb::StatsVolumeResponse { stats: Some(usage_to_proto(usage)) }))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().id))]
    async fn sync_volume(
        &self,
        request: Request<pb::SyncVolumeRequest>,
    ) -> Result<Response<pb::SyncVolumeResponse>, Status> {
        info!("gRPC: SyncVolume");

        let req = request.into_inner();
        self.manager.sync(&req.id).await.map_err(error_to_status)?;
        Ok(Response::new(pb::SyncVolumeResponse {}))
    }

    #[instrument(skip(self, _request))]
    async fn sync_volumes(
        &self,
        _request: Request<pb::SyncVolumesRequest>,
    ) -> Result<Response<pb::SyncVolumesResponse>, Status> {
        info!("gRPC: SyncVolumes");

        self.manager.sync_all().await.map_err(error_to_status)?;
        Ok(Response::new(pb::SyncVolumesResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_follows_the_taxonomy() {
        let cases = [
            (SiloError::InvalidArgument("x".into()), tonic::Code::InvalidArgument),
            (SiloError::NotFound("x".into()), tonic::Code::NotFound),
            (SiloError::AlreadyExists("x".into()), tonic::Code::AlreadyExists),
            (SiloError::FailedPrecondition("x".into()), tonic::Code::FailedPrecondition),
            (SiloError::Unauthenticated("x".into()), tonic::Code::Unauthenticated),
            (SiloError::Database("x".into()), tonic::Code::Internal),
            (SiloError::Internal("x".into()), tonic::Code::Internal),
            (
                SiloError::FieldType {
                    field: "capacity_bytes".into(),
                    expected: "number",
                    actual: "string",
                },
                tonic::Code::InvalidArgument,
            ),
        ];

        for (err, code) in cases {
            assert_eq!(error_to_status(err).code(), code);
        }
    }

    #[test]
    fn busy_dataset_maps_to_failed_precondition() {
        let err = SiloError::CommandFailed(zsilo_core::CommandResult {
            stdout: String::new(),
            stderr: "cannot destroy 'tank/vol_foo': dataset is busy".into(),
            exit_code: 1,
        });
        assert_eq!(error_to_status(err).code(), tonic::Code::FailedPrecondition);

        let err = SiloError::CommandFailed(zsilo_core::CommandResult {
            stdout: String::new(),
            stderr: "some other failure".into(),
            exit_code: 1,
        });
        assert_eq!(error_to_status(err).code(), tonic::Code::Internal);
    }
}
