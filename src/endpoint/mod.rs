//! Endpoint registry: binds listener sockets to virtual clusters and
//! reconciles broker addresses discovered via METADATA/FindCoordinator/
//! DescribeCluster responses.

pub mod registry;

pub use registry::{Binding, EndpointBindingPolicy, EndpointRegistry, VirtualCluster};
