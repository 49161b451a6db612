/// Service configuration loading.
pub mod config;
/// Geo primitives, distance engine and the concurrent geo index.
pub mod database;
/// Query coordination and background eviction.
pub mod engine;
/// Service-level error types.
pub mod error;
/// Logging setup (formatting, filters, sinks).
pub mod logging;
/// Line protocol and Tokio-based TCP server.
pub mod network;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// config
pub use config::Settings;
/// Geo types, distance functions and the index.
pub use database::{
    distance, haversine_km, AgentPosition, BoundingBox, DistanceUnit, GeoIndex, GeoIndexConfig,
    GeoPoint, Geohash, IndexStats, Neighbor, UpsertOutcome, EARTH_RADIUS_KM,
};
/// Query coordinator and staleness sweeper.
pub use engine::{EvictionConfig, QueryCoordinator, QueryPolicy, StaleSweeper};
/// Operation errors and result types.
pub use error::{ServiceError, ServiceResult};
pub use fleetgeo_error::{ErrorExt, GeoError, GeoResult, ProtocolError, StatusCode};
/// Logging.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Network server and protocol.
pub use network::{Command, Reply, Server};
