//! Geohash-ячейки, по которым гео-индекс раскладывает агентов.
//!
//! Сетка фиксированной точности `p` символов делит долготу на
//! `2^ceil(5p/2)` столбцов, а широту на `2^floor(5p/2)` строк. Ячейка
//! хранится как пара целых индексов (`CellId`), а не строка: соседние
//! ячейки и диапазоны для bbox считаются арифметикой, без перебора
//! префиксов. Строковый geohash нужен только для логов и статистики.

use crate::{
    database::{BoundingBox, MAX_LAT, MAX_LON, MIN_LAT, MIN_LON},
    GeoPoint,
};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
const BASE32_REV: [i8; 128] = build_base32_rev();

/// Минимальная поддерживаемая точность сетки (символов geohash).
pub const MIN_CELL_PRECISION: usize = 1;
/// Максимальная поддерживаемая точность сетки (символов geohash).
pub const MAX_CELL_PRECISION: usize = 12;

/// Строковый geohash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geohash {
    hash: String,
}

/// Индекс ячейки сетки: `x` это столбец по долготе, `y` строка по широте.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId {
    pub x: u32,
    pub y: u32,
}

/// Прямоугольный диапазон ячеек (включительно с обеих сторон).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

/// Сетка geohash-ячеек фиксированной точности.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellGrid {
    precision: usize,
    lon_bits: u32,
    lat_bits: u32,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Geohash {
    /// Кодирует точку в geohash из `chars` символов (бисекция интервалов).
    pub fn encode(
        point: GeoPoint,
        chars: usize,
    ) -> Self {
        let chars = chars.clamp(MIN_CELL_PRECISION, MAX_CELL_PRECISION);
        Self {
            hash: encode_base32(point.lon, point.lat, chars),
        }
    }

    /// Разбирает строку geohash; `None`, если встречен символ вне алфавита.
    pub fn parse(hash: &str) -> Option<Self> {
        if hash.is_empty() || hash.len() > MAX_CELL_PRECISION {
            return None;
        }
        let valid = hash
            .bytes()
            .all(|b| (b as usize) < BASE32_REV.len() && BASE32_REV[b as usize] >= 0);
        valid.then(|| Self {
            hash: hash.to_ascii_lowercase(),
        })
    }

    pub fn decode_bbox(&self) -> BoundingBox {
        decode_bbox(&self.hash)
    }

    /// Центр ячейки.
    pub fn decode(&self) -> GeoPoint {
        let bbox = self.decode_bbox();
        GeoPoint::new(
            (bbox.min_lat + bbox.max_lat) * 0.5,
            (bbox.min_lon + bbox.max_lon) * 0.5,
        )
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }

    pub fn precision(&self) -> usize {
        self.hash.len()
    }
}

impl CellRange {
    /// Кол-во ячеек в диапазоне.
    pub fn count(&self) -> u64 {
        ((self.max_x - self.min_x) as u64 + 1) * ((self.max_y - self.min_y) as u64 + 1)
    }

    /// Все ячейки диапазона.
    pub fn cells(&self) -> impl Iterator<Item = CellId> + '_ {
        (self.min_x..=self.max_x)
            .flat_map(move |x| (self.min_y..=self.max_y).map(move |y| CellId { x, y }))
    }
}

impl CellGrid {
    /// Создаёт сетку точности `precision` символов geohash.
    ///
    /// Паникует, если точность вне [`MIN_CELL_PRECISION`,
    /// `MAX_CELL_PRECISION`].
    pub fn new(precision: usize) -> Self {
        assert!(
            (MIN_CELL_PRECISION..=MAX_CELL_PRECISION).contains(&precision),
            "cell precision must be in range [{MIN_CELL_PRECISION}, {MAX_CELL_PRECISION}]"
        );
        let bits = (precision * 5) as u32;
        Self {
            precision,
            lon_bits: bits.div_ceil(2),
            lat_bits: bits / 2,
        }
    }

    pub fn precision(&self) -> usize {
        self.precision
    }

    /// Ширина ячейки по долготе в градусах.
    pub fn cell_width(&self) -> f64 {
        (MAX_LON - MIN_LON) / (1u64 << self.lon_bits) as f64
    }

    /// Высота ячейки по широте в градусах.
    pub fn cell_height(&self) -> f64 {
        (MAX_LAT - MIN_LAT) / (1u64 << self.lat_bits) as f64
    }

    /// Ячейка, содержащая точку. Точки на верхних границах (lon = 180,
    /// lat = 90) попадают в крайнюю ячейку, как и в geohash.
    pub fn cell_of(
        &self,
        point: GeoPoint,
    ) -> CellId {
        CellId {
            x: Self::axis_index(point.lon, MIN_LON, MAX_LON, self.lon_bits),
            y: Self::axis_index(point.lat, MIN_LAT, MAX_LAT, self.lat_bits),
        }
    }

    /// Диапазон ячеек, покрывающий bbox.
    pub fn range_for(
        &self,
        bbox: &BoundingBox,
    ) -> CellRange {
        let sw = self.cell_of(GeoPoint::new(bbox.min_lat, bbox.min_lon));
        let ne = self.cell_of(GeoPoint::new(bbox.max_lat, bbox.max_lon));
        CellRange {
            min_x: sw.x,
            max_x: ne.x,
            min_y: sw.y,
            max_y: ne.y,
        }
    }

    /// Границы ячейки в градусах.
    pub fn cell_bbox(
        &self,
        cell: CellId,
    ) -> BoundingBox {
        let w = self.cell_width();
        let h = self.cell_height();
        BoundingBox::new(
            MIN_LON + cell.x as f64 * w,
            MIN_LON + (cell.x + 1) as f64 * w,
            MIN_LAT + cell.y as f64 * h,
            MIN_LAT + (cell.y + 1) as f64 * h,
        )
    }

    /// Строковый geohash ячейки (чередование битов: сначала долгота).
    pub fn geohash(
        &self,
        cell: CellId,
    ) -> Geohash {
        let total_bits = self.precision * 5;
        let mut hash = String::with_capacity(self.precision);
        let mut chunk = 0u8;

        for i in 0..total_bits {
            let bit = if i % 2 == 0 {
                let shift = self.lon_bits - 1 - (i / 2) as u32;
                (cell.x >> shift) & 1
            } else {
                let shift = self.lat_bits - 1 - (i / 2) as u32;
                (cell.y >> shift) & 1
            };
            chunk = (chunk << 1) | bit as u8;
            if i % 5 == 4 {
                hash.push(BASE32[chunk as usize] as char);
                chunk = 0;
            }
        }

        Geohash { hash }
    }

    fn axis_index(
        value: f64,
        min: f64,
        max: f64,
        bits: u32,
    ) -> u32 {
        let cells = (1u64 << bits) as f64;
        let idx = ((value - min) / (max - min) * cells).floor();
        idx.clamp(0.0, cells - 1.0) as u32
    }
}

////////////////////////////////////////////////////////////////////////////////
// Внутренние методы и функции
////////////////////////////////////////////////////////////////////////////////

fn encode_base32(
    lon: f64,
    lat: f64,
    chars: usize,
) -> String {
    let mut lon_min = MIN_LON;
    let mut lon_max = MAX_LON;
    let mut lat_min = MIN_LAT;
    let mut lat_max = MAX_LAT;

    let mut hash = String::with_capacity(chars);
    let mut bits = 0u8;
    let mut bit_count = 0;

    // Производим чередование битов долготы/широты
    for _ in 0..chars * 5 {
        let is_lon = bit_count % 2 == 0;

        let (v, min, max) = if is_lon {
            (lon, &mut lon_min, &mut lon_max)
        } else {
            (lat, &mut lat_min, &mut lat_max)
        };

        let mid = (*min + *max) * 0.5;
        if v >= mid {
            bits |= 1 << (4 - (bit_count % 5));
            *min = mid;
        } else {
            *max = mid;
        }

        bit_count += 1;
        if bit_count % 5 == 0 {
            hash.push(BASE32[bits as usize] as char);
            bits = 0;
        }
    }
    hash
}

fn decode_bbox(hash: &str) -> BoundingBox {
    let mut lon_min = MIN_LON;
    let mut lon_max = MAX_LON;
    let mut lat_min = MIN_LAT;
    let mut lat_max = MAX_LAT;

    let mut bit_index = 0;

    for ch in hash.bytes() {
        let idx = match BASE32_REV.get(ch as usize) {
            Some(&idx) if idx >= 0 => idx,
            _ => break,
        };

        for i in 0..5 {
            let bit = (idx >> (4 - i)) & 1;
            let (min, max) = if bit_index % 2 == 0 {
                (&mut lon_min, &mut lon_max)
            } else {
                (&mut lat_min, &mut lat_max)
            };

            let mid = (*min + *max) * 0.5;
            if bit == 1 {
                *min = mid;
            } else {
                *max = mid;
            }

            bit_index += 1;
        }
    }

    BoundingBox::new(lon_min, lon_max, lat_min, lat_max)
}

const fn build_base32_rev() -> [i8; 128] {
    let mut table = [-1i8; 128];

    let mut i = 0;
    while i < BASE32.len() {
        let c = BASE32[i];
        table[c as usize] = i as i8;
        if c.is_ascii_lowercase() {
            table[c.to_ascii_uppercase() as usize] = i as i8;
        }
        i += 1;
    }
    table
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
