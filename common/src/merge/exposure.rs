use geo::{Area, BooleanOps, BoundingRect, MultiPolygon, Polygon, Rect, TriangulateEarcut};
use geojson::{Feature, JsonObject};
use rayon::prelude::*;
use rstar::{
    primitives::{GeomWithData, Rectangle},
    RTree, AABB,
};
use serde_json::json;
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Range,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info, warn};

use super::noise::{classify, reference_level, sum_weighted_levels, Period};
use super::tabular::{read_feature_collection, FeatureBatchWriter};
use crate::error::MergeError;

/// Grilla fina (`cell_size`) agrupada en celdas principales (`main_cell_size`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    cell_size: f64,
    main_cell_size: f64,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            cell_size: 10.0,
            main_cell_size: 800.0,
        }
    }
}

impl GridSpec {
    /// La celda principal debe ser un múltiplo entero de la celda fina.
    pub fn new(cell_size: f64, main_cell_size: f64) -> Result<Self, MergeError> {
        let invalid = MergeError::InvalidGrid {
            cell_size,
            main_cell_size,
        };
        if !(cell_size > 0.0 && cell_size.is_finite()) || main_cell_size < cell_size {
            return Err(invalid);
        }
        let ratio = main_cell_size / cell_size;
        if (ratio - ratio.round()).abs() > 1e-9 {
            return Err(invalid);
        }
        Ok(Self {
            cell_size,
            main_cell_size,
        })
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn main_cell_size(&self) -> f64 {
        self.main_cell_size
    }

    /// Celdas finas por lado de una celda principal.
    pub fn index_factor(&self) -> usize {
        (self.main_cell_size / self.cell_size).round() as usize
    }
}

/// Fragmento de isófona listo para el cruce con la grilla.
struct MergeUnit {
    polygon: Polygon<f64>,
    level_db: f64,
}

type UnitEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Celda principal ya reclasificada: una fila de la tabla `_MERGED`.
#[derive(Debug, Clone)]
pub struct MergedCell {
    pub main_index: usize,
    pub label: String,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub struct ExposureSummary {
    pub table: String,
    pub output: PathBuf,
    pub input_polygons: usize,
    pub output_features: usize,
}

/* --------- Geometría de la grilla --------- */

struct CellLayout {
    min_x: f64,
    min_y: f64,
    cell_size: f64,
    index_factor: usize,
    main_rows: usize,
}

impl CellLayout {
    fn new(extent: Rect<f64>, grid: &GridSpec) -> Self {
        let cell_size = grid.cell_size();
        let index_factor = grid.index_factor();
        let max_j = ((extent.height() / cell_size).ceil() as usize).max(1);
        Self {
            min_x: extent.min().x,
            min_y: extent.min().y,
            cell_size,
            index_factor,
            main_rows: max_j.div_ceil(index_factor),
        }
    }

    fn span(&self, min: f64, max: f64, origin: f64) -> Range<usize> {
        let start = ((min - origin) / self.cell_size).floor().max(0.0) as usize;
        let end = (((max - origin) / self.cell_size).ceil() as usize).max(start + 1);
        start..end
    }

    /// Celdas finas `(i, j)` que toca un rectángulo.
    fn cells_of(&self, rect: &Rect<f64>) -> (Range<usize>, Range<usize>) {
        (
            self.span(rect.min().x, rect.max().x, self.min_x),
            self.span(rect.min().y, rect.max().y, self.min_y),
        )
    }

    fn cell_rect(&self, i: usize, j: usize) -> Rect<f64> {
        let x1 = self.min_x + i as f64 * self.cell_size;
        let y1 = self.min_y + j as f64 * self.cell_size;
        Rect::new((x1, y1), (x1 + self.cell_size, y1 + self.cell_size))
    }

    fn main_cell_of(&self, i: usize, j: usize) -> (usize, usize) {
        (i / self.index_factor, j / self.index_factor)
    }

    fn main_index(&self, main_i: usize, main_j: usize) -> usize {
        main_i * self.main_rows + main_j
    }
}

fn envelope(rect: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

/// Triangula los polígonos más grandes que una celda. Si la triangulación
/// no produce nada se conserva el polígono original.
fn tessellate(polygon: &Polygon<f64>, cell_size: f64) -> Vec<Polygon<f64>> {
    let Some(rect) = polygon.bounding_rect() else {
        return Vec::new();
    };
    if rect.width() <= cell_size && rect.height() <= cell_size {
        return vec![polygon.clone()];
    }
    let triangles: Vec<Polygon<f64>> = polygon
        .earcut_triangles()
        .into_iter()
        .map(|t| t.to_polygon())
        .filter(|t| t.unsigned_area() > 0.0)
        .collect();
    if triangles.is_empty() {
        vec![polygon.clone()]
    } else {
        triangles
    }
}

/// Unión por reducción en árbol; las celdas no se solapan entre sí.
fn union_all(polygons: Vec<Polygon<f64>>) -> MultiPolygon<f64> {
    let mut layer: Vec<MultiPolygon<f64>> = polygons
        .into_iter()
        .map(|p| MultiPolygon::new(vec![p]))
        .collect();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => a.union(b),
                [a] => a.clone(),
                _ => MultiPolygon::new(Vec::new()),
            })
            .collect();
    }
    layer.pop().unwrap_or_else(|| MultiPolygon::new(Vec::new()))
}

/* --------- Reducción --------- */

/// Suma en potencia los niveles de todas las isófonas que caen en cada celda
/// fina, reclasifica la celda y une las celdas de igual banda dentro de cada
/// celda principal.
///
/// Las celdas principales se procesan en paralelo; el resultado sale ordenado
/// por celda principal y etiqueta.
pub fn reduce_classified(
    polygons: &[(Polygon<f64>, f64)],
    period: Period,
    grid: &GridSpec,
) -> Vec<MergedCell> {
    let extent = polygons
        .iter()
        .filter_map(|(p, _)| p.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                (a.min().x.min(b.min().x), a.min().y.min(b.min().y)),
                (a.max().x.max(b.max().x), a.max().y.max(b.max().y)),
            )
        });
    let Some(extent) = extent else {
        return Vec::new();
    };
    let layout = CellLayout::new(extent, grid);

    let units: Vec<MergeUnit> = polygons
        .iter()
        .flat_map(|(polygon, level_db)| {
            tessellate(polygon, grid.cell_size())
                .into_iter()
                .map(move |fragment| MergeUnit {
                    polygon: fragment,
                    level_db: *level_db,
                })
        })
        .collect();

    let mut entries: Vec<UnitEnvelope> = Vec::with_capacity(units.len());
    let mut main_cells: BTreeMap<(usize, usize), BTreeSet<(usize, usize)>> = BTreeMap::new();
    for (idx, unit) in units.iter().enumerate() {
        let Some(rect) = unit.polygon.bounding_rect() else {
            continue;
        };
        entries.push(GeomWithData::new(
            Rectangle::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
            idx,
        ));
        let (columns, rows) = layout.cells_of(&rect);
        for i in columns {
            for j in rows.clone() {
                main_cells
                    .entry(layout.main_cell_of(i, j))
                    .or_default()
                    .insert((i, j));
            }
        }
    }
    let tree = RTree::bulk_load(entries);

    debug!(
        fragments = units.len(),
        main_cells = main_cells.len(),
        fine_cells = main_cells.values().map(BTreeSet::len).sum::<usize>(),
        "grilla de fusión construida"
    );

    let main_cells: Vec<((usize, usize), BTreeSet<(usize, usize)>)> = main_cells.into_iter().collect();
    main_cells
        .into_par_iter()
        .flat_map_iter(|((main_i, main_j), cells)| {
            let mut by_label: BTreeMap<&'static str, Vec<Polygon<f64>>> = BTreeMap::new();

            for (i, j) in cells {
                let cell_rect = layout.cell_rect(i, j);
                let cell_polygon = cell_rect.to_polygon();
                let cell_area = cell_polygon.unsigned_area();

                let levels: Vec<(f64, f64)> = tree
                    .locate_in_envelope_intersecting(&envelope(&cell_rect))
                    .filter_map(|entry| {
                        let unit = &units[entry.data];
                        let area = cell_polygon.intersection(&unit.polygon).unsigned_area();
                        (area > 0.0).then_some((unit.level_db, area / cell_area))
                    })
                    .collect();

                if let Some(db) = sum_weighted_levels(levels) {
                    by_label
                        .entry(classify(period, db))
                        .or_default()
                        .push(cell_polygon);
                }
            }

            let main_index = layout.main_index(main_i, main_j);
            by_label
                .into_iter()
                .map(move |(label, cells)| MergedCell {
                    main_index,
                    label: label.to_string(),
                    geometry: union_all(cells),
                })
        })
        .collect()
}

/// Lee los polígonos clasificados de una tabla. Las features sin geometría
/// poligonal o con etiqueta desconocida se ignoran.
fn load_classified(
    path: &Path,
    classification_field: &str,
) -> Result<(Vec<(Polygon<f64>, f64)>, Option<String>), MergeError> {
    let collection = read_feature_collection(path)?;
    let mut polygons = Vec::new();
    let mut first_label = None;
    let mut skipped = 0usize;

    for feature in collection.features {
        let label = feature
            .properties
            .as_ref()
            .and_then(|props| props.get(classification_field))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let (Some(label), Some(geometry)) = (label, feature.geometry) else {
            skipped += 1;
            continue;
        };
        let Some(level_db) = reference_level(&label) else {
            skipped += 1;
            continue;
        };

        let geometry = geo::Geometry::<f64>::try_from(geometry.value).map_err(|e| {
            MergeError::GeoJson {
                path: path.to_path_buf(),
                source: Box::new(e),
            }
        })?;
        match geometry {
            geo::Geometry::Polygon(p) => polygons.push((p, level_db)),
            geo::Geometry::MultiPolygon(mp) => {
                polygons.extend(mp.0.into_iter().map(|p| (p, level_db)))
            }
            _ => {
                skipped += 1;
                continue;
            }
        }
        if first_label.is_none() {
            first_label = Some(label);
        }
    }

    if skipped > 0 && !polygons.is_empty() {
        warn!(file = %path.display(), skipped, "features sin clasificación válida ignoradas");
    }
    Ok((polygons, first_label))
}

/// Fusiona una tabla de exposición en `<TABLA>_MERGED.geojson`.
///
/// Devuelve `None` si la tabla no tiene polígonos clasificados (no es una
/// tabla de exposición).
pub fn merge_classified_polygons(
    table: &str,
    source: &Path,
    output_dir: &Path,
    grid: &GridSpec,
    classification_field: &str,
) -> Result<Option<ExposureSummary>, MergeError> {
    let started = Instant::now();
    let (polygons, first_label) = load_classified(source, classification_field)?;
    if polygons.is_empty() {
        return Ok(None);
    }

    let period = Period::detect(table, first_label.as_deref());
    info!(table, polygons = polygons.len(), ?period, "fusionando isófonas");

    let cells = reduce_classified(&polygons, period, grid);

    let output = output_dir.join(format!("{table}_MERGED.geojson"));
    let mut writer = FeatureBatchWriter::create(&output)?;
    for cell in &cells {
        let mut properties = JsonObject::new();
        properties.insert("ID".into(), json!(cell.main_index));
        properties.insert(classification_field.into(), json!(cell.label));
        writer.push(Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&cell.geometry))),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        })?;
    }
    let written = writer.finish()?;

    info!(
        table,
        output = %output.display(),
        features = written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "isófonas fusionadas"
    );

    Ok(Some(ExposureSummary {
        table: table.to_string(),
        output,
        input_polygons: polygons.len(),
        output_features: written,
    }))
}
