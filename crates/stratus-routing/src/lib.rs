//! Traffic routing for the stratus layer
//!
//! Two routers live here: the [`replica::ReplicaRouter`] picks a database
//! node that satisfies a read's consistency level, and the
//! [`balancer::GlobalBalancer`] picks regional endpoints under one of six
//! routing policies with continuous health probing.

pub mod balancer;
pub mod replica;

pub use balancer::{EndpointProber, GeoPoint, GeoResolver, GlobalBalancer, StaticGeoResolver};
pub use replica::{ConsistencyLevel, DatabaseProbe, NoopProbe, ReplicaRouter, RouteDecision};
