use std::sync::Arc;

use fleetgeo_error::{GeoError, GeoResult};
use serde::Deserialize;
use tracing::debug;

use crate::database::{
    distance, AgentPosition, DistanceUnit, GeoIndex, Neighbor, UpsertOutcome,
};

/// Максимальный радиус поиска по умолчанию, км.
pub const DEFAULT_MAX_RADIUS_KM: f64 = 500.0;

/// Максимальный размер выдачи по умолчанию.
pub const DEFAULT_MAX_LIMIT: usize = 1000;

/// Ограничения на параметры запросов.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueryPolicy {
    pub max_radius_km: f64,
    pub max_limit: usize,
}

/// Точка входа для внешних интерфейсов: проверяет параметры по политике и
/// вызывает индекс. Собственного состояния между вызовами не хранит.
#[derive(Debug, Clone)]
pub struct QueryCoordinator {
    index: Arc<GeoIndex>,
    policy: QueryPolicy,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl QueryCoordinator {
    pub fn new(
        index: Arc<GeoIndex>,
        policy: QueryPolicy,
    ) -> Self {
        Self { index, policy }
    }

    pub fn index(&self) -> &Arc<GeoIndex> {
        &self.index
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    /// UpsertPosition: записывает текущую позицию агента.
    pub fn upsert_position(
        &self,
        agent_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> GeoResult<UpsertOutcome> {
        self.index
            .upsert(agent_id, latitude, longitude)
            .inspect_err(|err| debug!(agent_id, %err, "upsert rejected"))
    }

    /// QueryNearby: идентификаторы ближайших агентов по возрастанию
    /// расстояния.
    ///
    /// `limit <= 0` означает "без явного лимита" и заменяется на
    /// `max_limit`; больший лимит молча урезается до `max_limit`.
    pub fn query_nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_km: f64,
        limit: i64,
    ) -> GeoResult<Vec<String>> {
        let neighbors = self.query_nearby_with_distances(latitude, longitude, radius_km, limit)?;
        Ok(neighbors.into_iter().map(|n| n.agent_id).collect())
    }

    /// То же, что [`Self::query_nearby`], но с расстояниями и позициями.
    pub fn query_nearby_with_distances(
        &self,
        latitude: f64,
        longitude: f64,
        radius_km: f64,
        limit: i64,
    ) -> GeoResult<Vec<Neighbor>> {
        self.check_radius(radius_km)?;
        let limit = self.effective_limit(limit);
        self.index.search(latitude, longitude, radius_km, limit)
    }

    pub fn remove_agent(
        &self,
        agent_id: &str,
    ) -> GeoResult<AgentPosition> {
        self.index.remove(agent_id)
    }

    pub fn position(
        &self,
        agent_id: &str,
    ) -> Option<AgentPosition> {
        self.index.get(agent_id)
    }

    /// Расстояние между двумя агентами в заданных единицах.
    pub fn distance(
        &self,
        a: &str,
        b: &str,
        unit: DistanceUnit,
    ) -> GeoResult<f64> {
        let pa = self.index.get(a).ok_or_else(|| GeoError::not_found(a))?;
        let pb = self.index.get(b).ok_or_else(|| GeoError::not_found(b))?;
        Ok(distance(pa.point, pb.point, unit))
    }

    fn check_radius(
        &self,
        radius_km: f64,
    ) -> GeoResult<()> {
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(GeoError::invalid_query(format!(
                "radius must be a positive number, got {radius_km}"
            )));
        }
        if radius_km > self.policy.max_radius_km {
            return Err(GeoError::invalid_query(format!(
                "radius {radius_km} km exceeds the maximum of {} km",
                self.policy.max_radius_km
            )));
        }
        Ok(())
    }

    fn effective_limit(
        &self,
        limit: i64,
    ) -> usize {
        let max = self.policy.max_limit.max(1);
        if limit <= 0 {
            return max;
        }
        usize::try_from(limit).map_or(max, |limit| limit.min(max))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            max_radius_km: DEFAULT_MAX_RADIUS_KM,
            max_limit: DEFAULT_MAX_LIMIT,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(max_limit: usize) -> QueryCoordinator {
        QueryCoordinator::new(
            Arc::new(GeoIndex::new()),
            QueryPolicy {
                max_radius_km: 100.0,
                max_limit,
            },
        )
    }

    #[test]
    fn test_radius_policy() {
        let c = coordinator(10);
        for radius in [0.0, -1.0, f64::NAN, f64::INFINITY, 100.5] {
            assert!(
                matches!(
                    c.query_nearby(0.0, 0.0, radius, 5),
                    Err(GeoError::InvalidQuery { .. })
                ),
                "radius {radius}"
            );
        }
        assert!(c.query_nearby(0.0, 0.0, 100.0, 5).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_center() {
        let c = coordinator(10);
        assert!(matches!(
            c.query_nearby(-91.0, 0.0, 1.0, 5),
            Err(GeoError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn test_limit_clamping() {
        let c = coordinator(3);
        for i in 0..5 {
            c.upsert_position(&format!("d{i}"), 0.0, i as f64 * 0.001)
                .unwrap();
        }
        assert_eq!(c.query_nearby(0.0, 0.0, 10.0, 100).unwrap().len(), 3);
        assert_eq!(c.query_nearby(0.0, 0.0, 10.0, 0).unwrap().len(), 3);
        assert_eq!(c.query_nearby(0.0, 0.0, 10.0, -7).unwrap().len(), 3);
        assert_eq!(
            c.query_nearby(0.0, 0.0, 10.0, 2).unwrap(),
            vec!["d0", "d1"]
        );
    }

    #[test]
    fn test_distance_units() {
        let c = coordinator(10);
        c.upsert_position("a", 0.0, 0.0).unwrap();
        c.upsert_position("b", 0.0, 0.5).unwrap();
        let km = c.distance("a", "b", DistanceUnit::Kilometers).unwrap();
        let m = c.distance("a", "b", DistanceUnit::Meters).unwrap();
        assert!((m - km * 1000.0).abs() < 1e-6);
        assert!(matches!(
            c.distance("a", "nobody", DistanceUnit::Miles),
            Err(GeoError::NotFound { .. })
        ));
    }

    #[test]
    fn test_remove_and_position() {
        let c = coordinator(10);
        c.upsert_position("a", 10.0, 20.0).unwrap();
        assert_eq!(c.position("a").unwrap().latitude(), 10.0);
        c.remove_agent("a").unwrap();
        assert!(c.position("a").is_none());
    }
}
