//! Federated round coordination: parallel site dispatch and cross-site
//! aggregation.

mod aggregate;
mod coordinator;
mod sites;

pub use aggregate::{
    aggregate_monitoring, aggregate_screening, merge_monitoring, AggregateMonitoringResult,
    FederatedScreeningResponse, GlobalMonitoringMetrics, MonitoringQueryResponse, RoundStatus,
};
pub use coordinator::{FederatedCoordinator, RoundConfig};
pub use sites::{
    compute_metrics, AdverseEventRecord, LabMeasurement, LocalSite, MonitoringRecord, RemoteSite,
    VisitRecord,
};
