pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod query;
pub mod resolver;
pub mod session;
pub mod transfer;
pub mod transport;

pub use client::ShimClient;
pub use config::{ClientConfig, ConnectionConfig};
pub use error::{ShimError, ShimResult};
pub use model::{
    AffineTransform, ArrayMetadata, Attribute, AttributeStats, Dimension, Rectangle, ScalarType,
    SpatialReference,
};
