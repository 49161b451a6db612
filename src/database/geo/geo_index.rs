//! Конкурентный гео-индекс текущих позиций агентов.
//!
//! Агенты раскладываются по geohash-ячейкам фиксированной точности, ячейки
//! распределены по шардам, каждый шард под своим `RwLock`. Локатор
//! (`agent_id -> ячейка`) живёт в `DashMap` и служит точкой сериализации
//! операций над одним агентом.
//!
//! Порядок захвата блокировок:
//! 1. писатель сначала берёт запись локатора для агента;
//! 2. затем шарды (старый и новый) строго по возрастанию индекса;
//! 3. читатель (поиск) локатор не трогает и берёт нужные шарды на чтение
//!    тоже по возрастанию индекса, все сразу.
//!
//! Поэтому взаимных блокировок нет, а поиск видит перемещение агента либо
//! целиком до, либо целиком после: ни потерянной записи, ни дубля.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, BinaryHeap, HashMap},
    hash::{DefaultHasher, Hash, Hasher},
    sync::atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use dashmap::{
    mapref::entry::{Entry, OccupiedEntry},
    DashMap,
};
use fleetgeo_error::{GeoError, GeoResult};
use ordered_float::OrderedFloat;
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::{
    database::{haversine_km, AgentPosition, BoundingBox, CellGrid, CellId, CellRange},
    GeoPoint,
};

/// Точность сетки по умолчанию: 5 символов geohash, ячейка ~4.9 x 4.9 км.
pub const DEFAULT_CELL_PRECISION: usize = 5;

/// Кол-во шардов по умолчанию.
pub const DEFAULT_SHARDS: usize = 64;

/// Максимальное кол-во шардов.
pub const MAX_SHARDS: usize = 1024;

/// Максимальная длина идентификатора агента в байтах по умолчанию.
pub const DEFAULT_MAX_AGENT_ID_LEN: usize = 256;

/// Верхняя граница предварительного выделения кучи результатов.
const MAX_HEAP_PREALLOC: usize = 1024;

/// Параметры гео-индекса.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GeoIndexConfig {
    /// Точность сетки в символах geohash.
    pub cell_precision: usize,
    /// Кол-во шардов с ячейками.
    pub shards: usize,
    /// Максимальная длина `agent_id` в байтах.
    pub max_agent_id_len: usize,
}

/// Что произошло с агентом при upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Агент появился в индексе впервые.
    Inserted,
    /// Агент сменил ячейку.
    Moved,
    /// Координаты изменились, ячейка та же.
    Updated,
    /// Координаты совпали, обновлена только метка времени.
    Unchanged,
}

/// Один результат радиусного поиска.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub agent_id: String,
    pub distance_km: f64,
    pub position: AgentPosition,
}

/// Снимок состояния индекса.
///
/// Шарды опрашиваются по очереди, поэтому при параллельных записях снимок
/// не обязан быть согласованным между шардами.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub agents: usize,
    pub occupied_cells: usize,
    pub shards: usize,
    pub cell_precision: usize,
    /// Самая населённая ячейка: geohash и кол-во агентов.
    pub busiest_cell: Option<(String, usize)>,
}

/// Гео-индекс: `agent_id -> текущая позиция` плюс пространственные бакеты.
#[derive(Debug)]
pub struct GeoIndex {
    grid: CellGrid,
    shards: Box<[RwLock<Shard>]>,
    locator: DashMap<String, Slot>,
    occupied_cells: AtomicUsize,
    max_agent_id_len: usize,
}

/// Запись локатора: где сейчас лежит агент.
#[derive(Debug, Clone, Copy)]
struct Slot {
    cell: CellId,
    point: GeoPoint,
    updated_at: DateTime<Utc>,
}

/// Ячейки одного шарда.
#[derive(Debug, Default)]
struct Shard {
    cells: HashMap<CellId, HashMap<String, AgentPosition>>,
}

/// Кандидат в результаты поиска, заимствует позицию из бакета.
#[derive(Debug)]
struct Candidate<'a> {
    distance: OrderedFloat<f64>,
    position: &'a AgentPosition,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl GeoIndex {
    pub fn new() -> Self {
        Self::with_config(GeoIndexConfig::default())
    }

    /// Создаёт индекс с заданными параметрами.
    ///
    /// Паникует, если точность сетки или кол-во шардов вне допустимого
    /// диапазона; конфигурация проверяется раньше, в `Settings::validate`.
    pub fn with_config(config: GeoIndexConfig) -> Self {
        assert!(
            config.shards > 0 && config.shards <= MAX_SHARDS,
            "shards must be in range (0, {MAX_SHARDS}]"
        );
        assert!(
            config.max_agent_id_len > 0,
            "max_agent_id_len must be positive"
        );

        let shards: Vec<_> = (0..config.shards)
            .map(|_| RwLock::new(Shard::default()))
            .collect();

        Self {
            grid: CellGrid::new(config.cell_precision),
            shards: shards.into_boxed_slice(),
            locator: DashMap::new(),
            occupied_cells: AtomicUsize::new(0),
            max_agent_id_len: config.max_agent_id_len,
        }
    }

    /// Вставляет или заменяет позицию агента, метка времени текущая.
    pub fn upsert(
        &self,
        agent_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> GeoResult<UpsertOutcome> {
        self.upsert_at(agent_id, latitude, longitude, Utc::now())
    }

    /// Вставляет или заменяет позицию агента с явной меткой времени.
    ///
    /// Если ячейка изменилась, агент переносится между бакетами под
    /// блокировками обоих шардов, так что поиск никогда не видит его
    /// дважды или ни разу.
    pub fn upsert_at(
        &self,
        agent_id: &str,
        latitude: f64,
        longitude: f64,
        updated_at: DateTime<Utc>,
    ) -> GeoResult<UpsertOutcome> {
        self.validate_agent_id(agent_id)?;
        let point = GeoPoint::new(latitude, longitude).validated()?;
        let cell = self.grid.cell_of(point);

        let position = AgentPosition {
            agent_id: agent_id.to_owned(),
            point,
            updated_at,
        };
        let slot = Slot {
            cell,
            point,
            updated_at,
        };

        match self.locator.entry(agent_id.to_owned()) {
            Entry::Vacant(vacant) => {
                {
                    let mut shard = self.shards[self.shard_index(cell)].write();
                    self.put(&mut shard, cell, position);
                }
                vacant.insert(slot);
                trace!(agent_id, ?cell, "agent inserted");
                Ok(UpsertOutcome::Inserted)
            }
            Entry::Occupied(mut occupied) => {
                let prev = *occupied.get();
                let outcome = if prev.cell != cell {
                    UpsertOutcome::Moved
                } else if prev.point == point {
                    UpsertOutcome::Unchanged
                } else {
                    UpsertOutcome::Updated
                };

                let from = self.shard_index(prev.cell);
                let to = self.shard_index(cell);

                if prev.cell == cell {
                    let mut shard = self.shards[from].write();
                    shard.replace(cell, position);
                } else if from == to {
                    let mut shard = self.shards[from].write();
                    self.take(&mut shard, prev.cell, agent_id);
                    self.put(&mut shard, cell, position);
                } else {
                    let (mut old, mut new) = self.write_pair(from, to);
                    self.take(&mut old, prev.cell, agent_id);
                    self.put(&mut new, cell, position);
                }

                occupied.insert(slot);

                if outcome == UpsertOutcome::Moved {
                    debug!(
                        agent_id,
                        from = %self.grid.geohash(prev.cell).as_str(),
                        to = %self.grid.geohash(cell).as_str(),
                        "agent moved between cells"
                    );
                } else {
                    trace!(agent_id, ?outcome, "agent position refreshed");
                }
                Ok(outcome)
            }
        }
    }

    /// Агенты в радиусе `radius_km` от центра, по возрастанию расстояния
    /// (при равенстве по `agent_id`), не больше `limit` штук.
    pub fn search(
        &self,
        latitude: f64,
        longitude: f64,
        radius_km: f64,
        limit: usize,
    ) -> GeoResult<Vec<Neighbor>> {
        let center = GeoPoint::new(latitude, longitude).validated()?;
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(GeoError::invalid_query(format!(
                "radius must be a finite non-negative number, got {radius_km}"
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let ranges: Vec<CellRange> = BoundingBox::covering_circle(center, radius_km)
            .iter()
            .map(|bbox| self.grid.range_for(bbox))
            .collect();
        let covered: u64 = ranges.iter().map(CellRange::count).sum();
        let occupied = self.occupied_cells.load(Ordering::Relaxed) as u64;

        let result = if covered > occupied {
            // Покрытие больше, чем вообще занятых ячеек: дешевле пройти все
            let guards: Vec<_> = self.shards.iter().map(|shard| shard.read()).collect();
            let positions = guards
                .iter()
                .flat_map(|guard| guard.cells.values())
                .flat_map(|bucket| bucket.values());
            select_nearest(center, radius_km, limit, positions)
        } else {
            let mut plan: BTreeMap<usize, Vec<CellId>> = BTreeMap::new();
            for range in &ranges {
                for cell in range.cells() {
                    plan.entry(self.shard_index(cell)).or_default().push(cell);
                }
            }
            // Два прямоугольника у антимеридиана могут задеть одну ячейку
            for cells in plan.values_mut() {
                cells.sort_unstable();
                cells.dedup();
            }

            // BTreeMap отдаёт шарды по возрастанию индекса
            let guards: Vec<_> = plan
                .into_iter()
                .map(|(idx, cells)| (self.shards[idx].read(), cells))
                .collect();
            let positions = guards
                .iter()
                .flat_map(|(guard, cells)| cells.iter().filter_map(|cell| guard.cells.get(cell)))
                .flat_map(|bucket| bucket.values());
            select_nearest(center, radius_km, limit, positions)
        };

        trace!(
            latitude,
            longitude,
            radius_km,
            limit,
            covered_cells = covered,
            found = result.len(),
            "radius search"
        );
        Ok(result)
    }

    /// Удаляет агента и возвращает его последнюю позицию.
    pub fn remove(
        &self,
        agent_id: &str,
    ) -> GeoResult<AgentPosition> {
        if agent_id.is_empty() {
            return Err(GeoError::invalid_identifier("agent id must not be empty"));
        }

        match self.locator.entry(agent_id.to_owned()) {
            Entry::Vacant(_) => Err(GeoError::not_found(agent_id)),
            Entry::Occupied(occupied) => {
                let position = self.detach(occupied);
                debug!(agent_id, "agent removed");
                Ok(position)
            }
        }
    }

    /// Текущая позиция агента.
    pub fn get(
        &self,
        agent_id: &str,
    ) -> Option<AgentPosition> {
        self.locator.get(agent_id).map(|slot| AgentPosition {
            agent_id: agent_id.to_owned(),
            point: slot.point,
            updated_at: slot.updated_at,
        })
    }

    /// Расстояние между двумя агентами в километрах.
    pub fn distance_between(
        &self,
        a: &str,
        b: &str,
    ) -> GeoResult<f64> {
        let pa = self.get(a).ok_or_else(|| GeoError::not_found(a))?;
        let pb = self.get(b).ok_or_else(|| GeoError::not_found(b))?;
        Ok(haversine_km(pa.point, pb.point))
    }

    /// Удаляет всех агентов, не обновлявшихся с `cutoff`. Возвращает
    /// кол-во удалённых.
    ///
    /// Метка времени перепроверяется под записью локатора, поэтому агент,
    /// обновившийся между сбором кандидатов и удалением, остаётся.
    pub fn evict_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> usize {
        let stale: Vec<String> = self
            .locator
            .iter()
            .filter(|entry| entry.updated_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for agent_id in stale {
            if let Entry::Occupied(occupied) = self.locator.entry(agent_id) {
                if occupied.get().updated_at < cutoff {
                    let position = self.detach(occupied);
                    trace!(agent_id = %position.agent_id, "stale agent evicted");
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!(evicted, %cutoff, "evicted stale agents");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.locator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locator.is_empty()
    }

    pub fn cell_precision(&self) -> usize {
        self.grid.precision()
    }

    pub fn stats(&self) -> IndexStats {
        let mut occupied_cells = 0;
        let mut busiest: Option<(CellId, usize)> = None;

        for shard in self.shards.iter() {
            let guard = shard.read();
            occupied_cells += guard.cells.len();
            for (cell, bucket) in &guard.cells {
                if busiest.map_or(true, |(_, n)| bucket.len() > n) {
                    busiest = Some((*cell, bucket.len()));
                }
            }
        }

        IndexStats {
            agents: self.len(),
            occupied_cells,
            shards: self.shards.len(),
            cell_precision: self.grid.precision(),
            busiest_cell: busiest
                .map(|(cell, n)| (self.grid.geohash(cell).as_str().to_owned(), n)),
        }
    }

    fn validate_agent_id(
        &self,
        agent_id: &str,
    ) -> GeoResult<()> {
        if agent_id.is_empty() {
            return Err(GeoError::invalid_identifier("agent id must not be empty"));
        }
        if agent_id.len() > self.max_agent_id_len {
            return Err(GeoError::invalid_identifier(format!(
                "agent id exceeds {} bytes",
                self.max_agent_id_len
            )));
        }
        if agent_id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(GeoError::invalid_identifier(
                "agent id must not contain whitespace or control characters",
            ));
        }
        Ok(())
    }

    fn shard_index(
        &self,
        cell: CellId,
    ) -> usize {
        let mut hasher = DefaultHasher::new();
        cell.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Берёт на запись два разных шарда по возрастанию индекса.
    /// Возвращает гарды в порядке аргументов.
    fn write_pair(
        &self,
        first: usize,
        second: usize,
    ) -> (RwLockWriteGuard<'_, Shard>, RwLockWriteGuard<'_, Shard>) {
        debug_assert_ne!(first, second);
        if first < second {
            let a = self.shards[first].write();
            let b = self.shards[second].write();
            (a, b)
        } else {
            let b = self.shards[second].write();
            let a = self.shards[first].write();
            (a, b)
        }
    }

    /// Убирает агента из бакета и из локатора. Вызывается под записью
    /// локатора.
    fn detach(
        &self,
        occupied: OccupiedEntry<'_, String, Slot>,
    ) -> AgentPosition {
        let slot = *occupied.get();
        let position = {
            let mut shard = self.shards[self.shard_index(slot.cell)].write();
            self.take(&mut shard, slot.cell, occupied.key())
        };
        occupied.remove();
        position
    }

    fn put(
        &self,
        shard: &mut Shard,
        cell: CellId,
        position: AgentPosition,
    ) {
        if shard.put(cell, position) {
            self.occupied_cells.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn take(
        &self,
        shard: &mut Shard,
        cell: CellId,
        agent_id: &str,
    ) -> AgentPosition {
        let (position, emptied) = shard.take(cell, agent_id);
        if emptied {
            self.occupied_cells.fetch_sub(1, Ordering::Relaxed);
        }
        position
    }
}

impl Shard {
    /// Кладёт позицию в ячейку. Возвращает `true`, если ячейка была пустой.
    fn put(
        &mut self,
        cell: CellId,
        position: AgentPosition,
    ) -> bool {
        let bucket = self.cells.entry(cell).or_default();
        let fresh = bucket.is_empty();
        if let Some(prev) = bucket.insert(position.agent_id.clone(), position) {
            panic!(
                "index corrupted: agent {} already present in cell {cell:?}",
                prev.agent_id
            );
        }
        fresh
    }

    /// Заменяет позицию агента в той же ячейке.
    fn replace(
        &mut self,
        cell: CellId,
        position: AgentPosition,
    ) {
        match self
            .cells
            .get_mut(&cell)
            .and_then(|bucket| bucket.get_mut(&position.agent_id))
        {
            Some(slot) => *slot = position,
            None => panic!(
                "index corrupted: agent {} missing from cell {cell:?}",
                position.agent_id
            ),
        }
    }

    /// Достаёт агента из ячейки, пустую ячейку удаляет. Второй элемент:
    /// `true`, если ячейка опустела.
    fn take(
        &mut self,
        cell: CellId,
        agent_id: &str,
    ) -> (AgentPosition, bool) {
        let Some(bucket) = self.cells.get_mut(&cell) else {
            panic!("index corrupted: cell {cell:?} of agent {agent_id} is not occupied");
        };
        let Some(position) = bucket.remove(agent_id) else {
            panic!("index corrupted: agent {agent_id} missing from cell {cell:?}");
        };
        let emptied = bucket.is_empty();
        if emptied {
            self.cells.remove(&cell);
        }
        (position, emptied)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Внутренние методы и функции
////////////////////////////////////////////////////////////////////////////////

/// Точный фильтр по гаверсинусу и отбор `limit` ближайших через max-heap.
fn select_nearest<'a>(
    center: GeoPoint,
    radius_km: f64,
    limit: usize,
    positions: impl Iterator<Item = &'a AgentPosition>,
) -> Vec<Neighbor> {
    let mut heap: BinaryHeap<Candidate<'a>> =
        BinaryHeap::with_capacity(limit.min(MAX_HEAP_PREALLOC));

    for position in positions {
        let distance = haversine_km(center, position.point);
        if distance > radius_km {
            continue;
        }
        let candidate = Candidate {
            distance: OrderedFloat(distance),
            position,
        };
        if heap.len() < limit {
            heap.push(candidate);
        } else if let Some(mut worst) = heap.peek_mut() {
            // peek даёт самого далёкого из отобранных
            if candidate < *worst {
                *worst = candidate;
            }
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|c| Neighbor {
            agent_id: c.position.agent_id.clone(),
            distance_km: c.distance.into_inner(),
            position: c.position.clone(),
        })
        .collect()
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for GeoIndexConfig {
    fn default() -> Self {
        Self {
            cell_precision: DEFAULT_CELL_PRECISION,
            shards: DEFAULT_SHARDS,
            max_agent_id_len: DEFAULT_MAX_AGENT_ID_LEN,
        }
    }
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Candidate<'_> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    fn cmp(
        &self,
        other: &Self,
    ) -> CmpOrdering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.position.agent_id.cmp(&other.position.agent_id))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
