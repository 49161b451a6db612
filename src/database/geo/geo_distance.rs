use std::str::FromStr;

use fleetgeo_error::ProtocolError;

use crate::GeoPoint;

/// Радиус Земли в километрах.
///
/// Совпадает с константой, которую использует Redis в GEO-командах, так что
/// расстояния совпадают с ответами GEOSEARCH/GEODIST до последнего знака.
pub const EARTH_RADIUS_KM: f64 = 6372.797560856;

pub const MIN_LAT: f64 = -90.0;
pub const MAX_LAT: f64 = 90.0;
pub const MIN_LON: f64 = -180.0;
pub const MAX_LON: f64 = 180.0;

/// Единицы измерения расстояния.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceUnit {
    Meters,
    #[default]
    Kilometers,
    Miles,
    Feet,
}

impl DistanceUnit {
    /// Конвертирует километры в указанную единицу.
    pub fn from_km(
        self,
        km: f64,
    ) -> f64 {
        match self {
            DistanceUnit::Meters => km * 1000.0,
            DistanceUnit::Kilometers => km,
            DistanceUnit::Miles => km / 1.609_344,
            DistanceUnit::Feet => km * 3_280.839_895,
        }
    }

    /// Конвертирует значение в этой единице в километры.
    pub fn to_km(
        self,
        value: f64,
    ) -> f64 {
        match self {
            DistanceUnit::Meters => value / 1000.0,
            DistanceUnit::Kilometers => value,
            DistanceUnit::Miles => value * 1.609_344,
            DistanceUnit::Feet => value / 3_280.839_895,
        }
    }

    /// Название единицы.
    pub fn name(&self) -> &'static str {
        match self {
            DistanceUnit::Meters => "m",
            DistanceUnit::Kilometers => "km",
            DistanceUnit::Miles => "mi",
            DistanceUnit::Feet => "ft",
        }
    }
}

impl FromStr for DistanceUnit {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "m" => Ok(DistanceUnit::Meters),
            "km" => Ok(DistanceUnit::Kilometers),
            "mi" => Ok(DistanceUnit::Miles),
            "ft" => Ok(DistanceUnit::Feet),
            _ => Err(ProtocolError::UnknownOption {
                command: "DIST",
                option: s.to_string(),
            }),
        }
    }
}

/// Кратчайшая разность долгот `lon2 - lon1` в градусах, в диапазоне
/// [-180, 180).
///
/// Точки по разные стороны антимеридиана (179.9 и -179.9) дают 0.2, а не
/// 359.8.
#[inline]
pub fn longitude_delta(
    lon1: f64,
    lon2: f64,
) -> f64 {
    (lon2 - lon1 + 180.0).rem_euclid(360.0) - 180.0
}

/// Расстояние по большому кругу в километрах (формула гаверсинуса).
///
/// Промежуточное значение `a` зажато в [0, 1]: у полюсов и для почти
/// антиподальных точек ошибки округления иначе дают NaN из `asin`.
pub fn haversine_km(
    p1: GeoPoint,
    p2: GeoPoint,
) -> f64 {
    let lat1 = p1.lat.to_radians();
    let lat2 = p2.lat.to_radians();
    let dlat = (p2.lat - p1.lat).to_radians();
    let dlon = longitude_delta(p1.lon, p2.lon).to_radians();

    let a = (dlat * 0.5).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon * 0.5).sin().powi(2);
    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Расстояние между точками в заданных единицах.
pub fn distance(
    p1: GeoPoint,
    p2: GeoPoint,
    unit: DistanceUnit,
) -> f64 {
    unit.from_km(haversine_km(p1, p2))
}
