use std::collections::BTreeMap;

use fleetgeo::{haversine_km, GeoIndex, GeoIndexConfig, GeoPoint};
use proptest::prelude::*;

/// Полный перебор: все агенты в радиусе, по (расстояние, id), первые `limit`.
fn brute_force(
    agents: &BTreeMap<String, GeoPoint>,
    center: GeoPoint,
    radius_km: f64,
    limit: usize,
) -> Vec<String> {
    let mut hits: Vec<(f64, &String)> = agents
        .iter()
        .map(|(id, p)| (haversine_km(center, *p), id))
        .filter(|(d, _)| *d <= radius_km)
        .collect();
    hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    hits.into_iter().take(limit).map(|(_, id)| id.clone()).collect()
}

fn coordinate() -> impl Strategy<Value = (f64, f64)> {
    (-89.0f64..89.0, -180.0f64..180.0)
}

/// Точки, сгруппированные вокруг нескольких городов, плюс антимеридиан.
fn clustered_coordinate() -> impl Strategy<Value = (f64, f64)> {
    let hubs = prop::sample::select(vec![
        (55.75, 37.61),
        (40.71, -74.0),
        (0.0, 179.95),
        (-33.86, 151.2),
    ]);
    (hubs, -0.5f64..0.5, -0.5f64..0.5).prop_map(|((lat, lon), dlat, dlon)| {
        let mut lon = lon + dlon;
        if lon > 180.0 {
            lon -= 360.0;
        }
        (lat + dlat, lon)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_search_matches_brute_force(
        ops in prop::collection::vec((0u8..3, 0usize..40, clustered_coordinate()), 1..200),
        center in clustered_coordinate(),
        radius_km in 0.1f64..120.0,
        limit in 1usize..30,
        precision in 3usize..7,
    ) {
        let index = GeoIndex::with_config(GeoIndexConfig {
            cell_precision: precision,
            shards: 8,
            ..Default::default()
        });
        let mut model = BTreeMap::new();

        for (op, agent, (lat, lon)) in ops {
            let id = format!("agent-{agent}");
            match op {
                0 | 1 => { // upsert
                    index.upsert(&id, lat, lon).unwrap();
                    model.insert(id, GeoPoint::new(lat, lon));
                }
                2 => { // remove
                    let r1 = index.remove(&id).is_ok();
                    let r2 = model.remove(&id).is_some();
                    prop_assert_eq!(r1, r2);
                }
                _ => unreachable!(),
            }
            prop_assert_eq!(index.len(), model.len());
        }

        let found: Vec<String> = index
            .search(center.0, center.1, radius_km, limit)
            .unwrap()
            .into_iter()
            .map(|n| n.agent_id)
            .collect();
        prop_assert_eq!(found, brute_force(&model, GeoPoint::new(center.0, center.1), radius_km, limit));
    }

    #[test]
    fn prop_search_anywhere_matches_brute_force(
        points in prop::collection::vec(coordinate(), 0..100),
        center in coordinate(),
        radius_km in 1.0f64..3000.0,
    ) {
        let index = GeoIndex::new();
        let mut model = BTreeMap::new();

        for (i, (lat, lon)) in points.into_iter().enumerate() {
            let id = format!("p{i}");
            index.upsert(&id, lat, lon).unwrap();
            model.insert(id, GeoPoint::new(lat, lon));
        }

        let found: Vec<String> = index
            .search(center.0, center.1, radius_km, 50)
            .unwrap()
            .into_iter()
            .map(|n| n.agent_id)
            .collect();
        prop_assert_eq!(found, brute_force(&model, GeoPoint::new(center.0, center.1), radius_km, 50));
    }

    #[test]
    fn prop_distance_symmetric_and_bounded(a in coordinate(), b in coordinate()) {
        let pa = GeoPoint::new(a.0, a.1);
        let pb = GeoPoint::new(b.0, b.1);
        let ab = haversine_km(pa, pb);

        prop_assert!((ab - haversine_km(pb, pa)).abs() < 1e-9);
        prop_assert!(ab >= 0.0);
        prop_assert!(ab <= fleetgeo::EARTH_RADIUS_KM * std::f64::consts::PI + 1e-6);
    }
}
