pub mod internal_events;
pub mod upstream_requests;
pub mod upstream_traffic;
pub mod upstream_usages;

pub use internal_events::Entity as InternalEvents;
pub use upstream_requests::Entity as UpstreamRequests;
pub use upstream_traffic::Entity as UpstreamTraffic;
pub use upstream_usages::Entity as UpstreamUsages;
