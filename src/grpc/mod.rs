pub mod convert;
pub mod owner_client;
pub mod schedd_service;
pub mod server;

pub use owner_client::GrpcResourceOwner;
pub use schedd_service::ScheddService;
pub use server::GrpcServer;
