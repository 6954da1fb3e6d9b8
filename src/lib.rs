pub mod acquirer;
pub mod ad;
pub mod admission;
pub mod claim;
pub mod config;
pub mod core;
pub mod error;
pub mod grpc;
pub mod handler;
pub mod job;
pub mod negotiator;
pub mod policy;
pub mod reconcile;
pub mod shutdown;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("schedd");
}
