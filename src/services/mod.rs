//! Service layer: storage backends, provisioning, object writes, metadata,
//! identity, and the gateway that orchestrates them.

pub mod identity_service;
pub mod local_backend;
pub mod metadata_service;
pub mod object_store;
pub mod provisioner;
pub mod rest_backend;
pub mod storage_backend;
pub mod upload_gateway;
