use geo::EuclideanLength;
use geojson::{FeatureCollection, GeoJson};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::Path,
};

use crate::error::PartitionError;

/// Nombre del archivo de particiones dentro del directorio de trabajo.
pub const PARTITION_CONFIG_FILE: &str = "cluster_config.json";

/// Unidad de trabajo: una entidad fuente (ej: un UUEID de rutas) con su costo estimado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    /// Pool de origen ("roads", "rails", ...)
    pub category: String,
    /// Proporcional al costo de cálculo (ej: largo total de las geometrías)
    pub weight: f64,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, category: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            weight,
        }
    }
}

/// Conjunto de unidades asignadas a un nodo / índice del array de tareas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub node_id: usize,
    #[serde(rename = "weightSum")]
    pub total_weight: f64,
    pub unit_ids: Vec<String>,
    #[serde(default)]
    pub units_by_category: BTreeMap<String, Vec<String>>,
}

impl Partition {
    fn empty(node_id: usize) -> Self {
        Self {
            node_id,
            total_weight: 0.0,
            unit_ids: Vec::new(),
            units_by_category: BTreeMap::new(),
        }
    }

    fn push(&mut self, unit: &WorkUnit) {
        self.total_weight += unit.weight;
        self.unit_ids.push(unit.id.clone());
        self.units_by_category
            .entry(unit.category.clone())
            .or_default()
            .push(unit.id.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.unit_ids.is_empty()
    }
}

/// Orden de "la más liviana primero". A igual peso gana la que tiene menos
/// unidades y después el índice de nodo, así ninguna partición queda vacía
/// aunque haya unidades de peso cero.
fn lighter_first(a: &Partition, b: &Partition) -> Ordering {
    a.total_weight
        .total_cmp(&b.total_weight)
        .then(a.unit_ids.len().cmp(&b.unit_ids.len()))
        .then(a.node_id.cmp(&b.node_id))
}

/// Reparte las unidades en `n` particiones balanceadas (heurística greedy LPT).
///
/// Cada unidad, en el orden recibido, va a la partición con menos peso
/// acumulado; después se reordena la lista de particiones. `n` se limita a la
/// cantidad de identificadores distintos, nunca se crean particiones vacías.
/// Los dos pools (rutas y vías férreas) comparten las mismas particiones.
pub fn partition(units: &[WorkUnit], n: usize) -> Vec<Partition> {
    let distinct: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
    let n = n.min(distinct.len());
    if n == 0 {
        return Vec::new();
    }

    let mut partitions: Vec<Partition> = (0..n).map(Partition::empty).collect();
    // índices de `partitions`, siempre ordenados de la más liviana a la más pesada
    let mut order: Vec<usize> = (0..n).collect();

    for unit in units {
        let lightest = order[0];
        partitions[lightest].push(unit);
        order.sort_by(|&a, &b| lighter_first(&partitions[a], &partitions[b]));
    }

    partitions
}

/// Orden LPT: unidades más pesadas primero (estable ante empates).
pub fn sort_heaviest_first(units: &mut [WorkUnit]) {
    units.sort_by(|a, b| b.weight.total_cmp(&a.weight));
}

/// Documento de particiones que lee cada tarea remota.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionConfig {
    pub partitions: Vec<Partition>,
}

impl PartitionConfig {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.partitions.iter().map(|p| p.total_weight).sum()
    }

    /// Partición de un nodo concreto (lo único que necesita una tarea del array).
    pub fn for_node(&self, node_id: usize) -> Result<&Partition, PartitionError> {
        self.partitions
            .iter()
            .find(|p| p.node_id == node_id)
            .ok_or(PartitionError::UnknownNode(node_id))
    }

    pub fn write(&self, path: &Path) -> Result<(), PartitionError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| PartitionError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| PartitionError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read(path: &Path) -> Result<Self, PartitionError> {
        let text = fs::read_to_string(path).map_err(|source| PartitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| PartitionError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn key_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn line_length(geometry: &geo::Geometry<f64>) -> f64 {
    match geometry {
        geo::Geometry::Line(l) => l.euclidean_length(),
        geo::Geometry::LineString(ls) => ls.euclidean_length(),
        geo::Geometry::MultiLineString(mls) => mls.euclidean_length(),
        geo::Geometry::GeometryCollection(gc) => gc.iter().map(line_length).sum(),
        _ => 0.0,
    }
}

/// Construye las unidades de trabajo de un extracto GeoJSON de fuentes:
/// agrupa las features por `key_field` y suma el largo de sus líneas.
/// El orden de salida es el de primera aparición de cada clave.
pub fn units_from_geojson(
    path: &Path,
    key_field: &str,
    category: &str,
) -> Result<Vec<WorkUnit>, PartitionError> {
    let text = fs::read_to_string(path).map_err(|source| PartitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let geojson: GeoJson = text.parse().map_err(|e| PartitionError::GeoJson {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    let collection = FeatureCollection::try_from(geojson).map_err(|e| PartitionError::GeoJson {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;

    let mut units: Vec<WorkUnit> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for feature in collection.features {
        let Some(key) = feature
            .properties
            .as_ref()
            .and_then(|props| props.get(key_field))
            .and_then(key_as_string)
        else {
            continue;
        };

        let length = match feature.geometry {
            Some(geometry) => {
                let geom = geo::Geometry::<f64>::try_from(geometry.value).map_err(|e| {
                    PartitionError::GeoJson {
                        path: path.to_path_buf(),
                        source: Box::new(e),
                    }
                })?;
                line_length(&geom)
            }
            None => 0.0,
        };

        match index.get(&key) {
            Some(&i) => units[i].weight += length,
            None => {
                index.insert(key.clone(), units.len());
                units.push(WorkUnit::new(key, category, length));
            }
        }
    }

    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(weights: &[f64]) -> Vec<WorkUnit> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| WorkUnit::new(format!("u{i}"), "roads", *w))
            .collect()
    }

    /// Generador lineal congruente: pesos "aleatorios" pero reproducibles.
    fn pseudo_random_weights(seed: u64, count: usize) -> Vec<f64> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) % 1000) as f64 + 1.0
            })
            .collect()
    }

    #[test]
    fn partition_escenario_10_10_10_1() {
        let parts = partition(&units(&[10.0, 10.0, 10.0, 1.0]), 2);
        assert_eq!(parts.len(), 2);

        let mut sums: Vec<f64> = parts.iter().map(|p| p.total_weight).collect();
        sums.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(sums, vec![11.0, 20.0]);

        // desempate determinista: la primera partición recibe el tercer 10
        assert_eq!(parts[0].unit_ids, vec!["u0", "u2"]);
        assert_eq!(parts[1].unit_ids, vec!["u1", "u3"]);
    }

    #[test]
    fn partition_es_determinista() {
        let input = units(&pseudo_random_weights(7, 50));
        assert_eq!(partition(&input, 6), partition(&input, 6));
    }

    #[test]
    fn partition_respeta_cota_lpt_y_no_deja_vacias() {
        for seed in 1..20u64 {
            let weights = pseudo_random_weights(seed, 40);
            let heaviest = weights.iter().cloned().fold(0.0, f64::max);
            let mut input = units(&weights);
            sort_heaviest_first(&mut input);

            for n in 1..=8 {
                let parts = partition(&input, n);
                assert_eq!(parts.len(), n);
                assert!(parts.iter().all(|p| !p.is_empty()));

                let max = parts.iter().map(|p| p.total_weight).fold(f64::MIN, f64::max);
                let min = parts.iter().map(|p| p.total_weight).fold(f64::MAX, f64::min);
                assert!(max - min <= heaviest + 1e-9, "seed={seed} n={n}");

                let total: f64 = parts.iter().map(|p| p.total_weight).sum();
                assert!((total - weights.iter().sum::<f64>()).abs() < 1e-6);

                let assigned: usize = parts.iter().map(|p| p.unit_ids.len()).sum();
                assert_eq!(assigned, input.len());
            }
        }
    }

    #[test]
    fn partition_sin_ordenar_mantiene_la_cota_greedy() {
        for seed in 20..40u64 {
            // el orden de llegada es el del generador, sin ordenar
            let weights = pseudo_random_weights(seed, 37);
            let heaviest = weights.iter().cloned().fold(0.0, f64::max);
            let total: f64 = weights.iter().sum();
            let input = units(&weights);

            for n in 2..=7 {
                let parts = partition(&input, n);
                assert_eq!(parts.len(), n);
                assert!(parts.iter().all(|p| !p.is_empty()));

                let max = parts.iter().map(|p| p.total_weight).fold(f64::MIN, f64::max);
                let min = parts.iter().map(|p| p.total_weight).fold(f64::MAX, f64::min);
                assert!(max - min <= heaviest + 1e-9, "seed={seed} n={n}");
                // cota de Graham: nunca más que el promedio más la unidad más pesada
                assert!(max <= total / n as f64 + heaviest + 1e-9, "seed={seed} n={n}");
            }
        }
    }

    #[test]
    fn partition_reordenada_reparte_el_mismo_peso() {
        let weights = [1.0, 9.0, 2.0, 8.0, 3.0, 7.0, 4.0, 6.0, 5.0];
        let mut shuffled = units(&weights);
        shuffled.reverse();
        shuffled.swap(0, 4);

        let parts = partition(&shuffled, 3);
        let max = parts.iter().map(|p| p.total_weight).fold(f64::MIN, f64::max);
        let min = parts.iter().map(|p| p.total_weight).fold(f64::MAX, f64::min);
        assert!(max - min <= 9.0);
        assert_eq!(parts.iter().map(|p| p.total_weight).sum::<f64>(), 45.0);

        // llegada 3,6,4,7,5,8,2,9,1 -> cargas 19, 14, 12
        assert_eq!(max, 19.0);

        // ordenadas primero (LPT) quedan 16, 15, 14
        sort_heaviest_first(&mut shuffled);
        let balanced = partition(&shuffled, 3);
        let mut loads: Vec<f64> = balanced.iter().map(|p| p.total_weight).collect();
        loads.sort_by(|a, b| b.total_cmp(a));
        assert_eq!(loads, vec![16.0, 15.0, 14.0]);
    }

    #[test]
    fn partition_limita_n_a_unidades_distintas() {
        assert!(partition(&[], 4).is_empty());

        let parts = partition(&units(&[3.0, 2.0]), 5);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn partition_con_pesos_cero_no_deja_particiones_vacias() {
        let parts = partition(&units(&[0.0, 0.0, 0.0]), 3);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.unit_ids.len() == 1));
    }

    #[test]
    fn partition_mezcla_los_dos_pools() {
        let input = vec![
            WorkUnit::new("r1", "roads", 8.0),
            WorkUnit::new("f1", "rails", 5.0),
            WorkUnit::new("r2", "roads", 4.0),
            WorkUnit::new("f2", "rails", 4.0),
        ];
        let parts = partition(&input, 2);
        // r1 -> 0, f1 -> 1, r2 -> 1 (5 < 8), f2 -> 0 (8 < 9)
        assert_eq!(parts[0].total_weight, 12.0);
        assert_eq!(parts[1].total_weight, 9.0);
        assert_eq!(parts[1].units_by_category["rails"], vec!["f1"]);
        assert_eq!(parts[1].units_by_category["roads"], vec!["r2"]);
    }

    #[test]
    fn partition_config_se_escribe_y_cada_nodo_lee_la_suya() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PARTITION_CONFIG_FILE);

        let config = PartitionConfig::new(partition(&units(&[5.0, 4.0, 3.0]), 2));
        config.write(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"nodeId\""));
        assert!(text.contains("\"weightSum\""));
        assert!(text.contains("\"unitIds\""));

        let back = PartitionConfig::read(&path).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.for_node(1).unwrap().unit_ids, vec!["u1", "u2"]);
        assert!(matches!(
            back.for_node(9),
            Err(PartitionError::UnknownNode(9))
        ));
    }

    #[test]
    fn units_from_geojson_agrupa_por_clave_y_suma_largos() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ROADS.geojson");
        fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{"UUEID":"A"},
                 "geometry":{"type":"LineString","coordinates":[[0,0],[3,4]]}},
                {"type":"Feature","properties":{"UUEID":"B"},
                 "geometry":{"type":"LineString","coordinates":[[0,0],[0,2]]}},
                {"type":"Feature","properties":{"UUEID":"A"},
                 "geometry":{"type":"MultiLineString","coordinates":[[[0,0],[1,0]],[[0,0],[0,1]]]}},
                {"type":"Feature","properties":{"OTHER":"x"},
                 "geometry":{"type":"LineString","coordinates":[[0,0],[9,9]]}}
            ]}"#,
        )
        .unwrap();

        let found = units_from_geojson(&path, "UUEID", "roads").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "A");
        assert!((found[0].weight - 7.0).abs() < 1e-9);
        assert_eq!(found[1].id, "B");
        assert!((found[1].weight - 2.0).abs() < 1e-9);
        assert!(found.iter().all(|u| u.category == "roads"));
    }
}
