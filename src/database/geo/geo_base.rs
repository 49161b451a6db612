use chrono::{DateTime, Utc};
use fleetgeo_error::{GeoError, GeoResult};

use crate::database::{EARTH_RADIUS_KM, MAX_LAT, MAX_LON, MIN_LAT, MIN_LON};

/// Запас (в градусах) при построении bounding box поиска, чтобы ошибки
/// округления не отсекали точки на самой границе радиуса (~1 см).
const BOUNDS_PAD_DEG: f64 = 1e-7;

/// Географическая точка (широта и долгота в градусах).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Текущее положение агента.
///
/// На каждый `agent_id` в индексе существует ровно одна запись; новый upsert
/// заменяет её целиком, история не хранится.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentPosition {
    pub agent_id: String,
    pub point: GeoPoint,
    pub updated_at: DateTime<Utc>,
}

/// Прямоугольная область на карте (в градусах), `min_lon <= max_lon`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl GeoPoint {
    pub fn new(
        lat: f64,
        lon: f64,
    ) -> Self {
        Self { lat, lon }
    }

    /// Широта в [-90, 90] и долгота в [-180, 180]. NaN и бесконечности
    /// не проходят проверку диапазона.
    pub fn is_valid(&self) -> bool {
        (MIN_LAT..=MAX_LAT).contains(&self.lat) && (MIN_LON..=MAX_LON).contains(&self.lon)
    }

    /// Возвращает точку, если координаты валидны, иначе `InvalidCoordinate`.
    pub fn validated(self) -> GeoResult<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(GeoError::InvalidCoordinate {
                latitude: self.lat,
                longitude: self.lon,
            })
        }
    }
}

impl AgentPosition {
    pub fn latitude(&self) -> f64 {
        self.point.lat
    }

    pub fn longitude(&self) -> f64 {
        self.point.lon
    }
}

impl BoundingBox {
    /// Создаёт bounding box из двух углов.
    pub fn new(
        min_lon: f64,
        max_lon: f64,
        min_lat: f64,
        max_lat: f64,
    ) -> Self {
        Self {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }
    }

    /// Весь земной шар.
    pub fn world() -> Self {
        Self::new(MIN_LON, MAX_LON, MIN_LAT, MAX_LAT)
    }

    /// Проверяет, содержит ли bbox точку.
    pub fn contains_point(
        &self,
        point: GeoPoint,
    ) -> bool {
        point.lon >= self.min_lon
            && point.lon <= self.max_lon
            && point.lat >= self.min_lat
            && point.lat <= self.max_lat
    }

    /// Консервативное покрытие круга радиуса `radius_km` вокруг `center`.
    ///
    /// Возвращает один прямоугольник или два, если круг пересекает
    /// антимеридиан. Если круг накрывает полюс, диапазон долгот расширяется
    /// до [-180, 180]. Любая точка на расстоянии `<= radius_km` (по гаверсинусу)
    /// гарантированно попадает хотя бы в один из прямоугольников.
    pub fn covering_circle(
        center: GeoPoint,
        radius_km: f64,
    ) -> Vec<BoundingBox> {
        let angular = radius_km / EARTH_RADIUS_KM;
        if angular >= std::f64::consts::PI {
            return vec![Self::world()];
        }

        let lat_delta = angular.to_degrees() + BOUNDS_PAD_DEG;
        let min_lat = center.lat - lat_delta;
        let max_lat = center.lat + lat_delta;

        // Круг накрывает полюс, по долготе ограничений нет
        if min_lat <= MIN_LAT || max_lat >= MAX_LAT {
            return vec![Self::new(
                MIN_LON,
                MAX_LON,
                min_lat.max(MIN_LAT),
                max_lat.min(MAX_LAT),
            )];
        }

        let ratio = angular.sin() / center.lat.to_radians().cos();
        if ratio >= 1.0 {
            return vec![Self::new(MIN_LON, MAX_LON, min_lat, max_lat)];
        }

        let lon_delta = ratio.asin().to_degrees() + BOUNDS_PAD_DEG;
        if lon_delta >= 180.0 {
            return vec![Self::new(MIN_LON, MAX_LON, min_lat, max_lat)];
        }

        let min_lon = center.lon - lon_delta;
        let max_lon = center.lon + lon_delta;

        if min_lon < MIN_LON {
            vec![
                Self::new(min_lon + 360.0, MAX_LON, min_lat, max_lat),
                Self::new(MIN_LON, max_lon, min_lat, max_lat),
            ]
        } else if max_lon > MAX_LON {
            vec![
                Self::new(min_lon, MAX_LON, min_lat, max_lat),
                Self::new(MIN_LON, max_lon - 360.0, min_lat, max_lat),
            ]
        } else {
            vec![Self::new(min_lon, max_lon, min_lat, max_lat)]
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
