use geojson::{Feature, FeatureCollection, GeoJson};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::error::MergeError;

/// Tamaño máximo de un lote de escritura de features.
pub const BATCH_MAX_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableFormat {
    Csv,
    GeoJson,
}

impl TableFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::GeoJson => "geojson",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(TableFormat::Csv),
            "geojson" => Some(TableFormat::GeoJson),
            _ => None,
        }
    }
}

/// Convención de nombres de los outputs parciales: `<prefix><índice><separator><TABLA>.<ext>`.
#[derive(Debug, Clone)]
pub struct ResultNaming {
    pub prefix: String,
    pub separator: String,
}

impl Default for ResultNaming {
    fn default() -> Self {
        Self {
            prefix: "out_".into(),
            separator: "_".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFileName {
    pub partition: usize,
    pub table: String,
    pub format: TableFormat,
}

impl ResultNaming {
    pub fn parse(&self, file_name: &str) -> Option<ResultFileName> {
        let rest = file_name.strip_prefix(&self.prefix)?;
        let (index, rest) = rest.split_once(&self.separator)?;
        let partition = index.parse::<usize>().ok()?;
        let (table, ext) = rest.rsplit_once('.')?;
        if table.is_empty() {
            return None;
        }
        Some(ResultFileName {
            partition,
            table: table.to_ascii_uppercase(),
            format: TableFormat::from_extension(ext)?,
        })
    }

    /// Patrón glob de los outputs de una partición.
    pub fn partition_glob(&self, partition: usize) -> String {
        format!("{}{}{}*", self.prefix, partition, self.separator)
    }
}

/// Tabla fusionada escrita en el directorio de salida.
#[derive(Debug, Clone)]
pub struct MergedTable {
    pub name: String,
    pub format: TableFormat,
    pub path: PathBuf,
    pub rows: usize,
    pub merged_files: usize,
    /// Archivos vacíos descartados
    pub dropped_files: usize,
}

/* --------- Escritura de FeatureCollections por lotes --------- */

/// Escribe una FeatureCollection de a lotes sin mantener todo en memoria.
pub(crate) struct FeatureBatchWriter {
    path: PathBuf,
    out: BufWriter<File>,
    pending: Vec<Feature>,
    written: usize,
}

impl FeatureBatchWriter {
    pub(crate) fn create(path: &Path) -> Result<Self, MergeError> {
        let file = File::create(path).map_err(|e| MergeError::io(path, e))?;
        let mut out = BufWriter::new(file);
        out.write_all(br#"{"type":"FeatureCollection","features":["#)
            .map_err(|e| MergeError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
            pending: Vec::with_capacity(BATCH_MAX_SIZE),
            written: 0,
        })
    }

    pub(crate) fn push(&mut self, feature: Feature) -> Result<(), MergeError> {
        self.pending.push(feature);
        if self.pending.len() >= BATCH_MAX_SIZE {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<(), MergeError> {
        for feature in self.pending.drain(..) {
            if self.written > 0 {
                self.out
                    .write_all(b",")
                    .map_err(|e| MergeError::io(&self.path, e))?;
            }
            serde_json::to_writer(&mut self.out, &feature).map_err(|source| MergeError::Json {
                path: self.path.clone(),
                source,
            })?;
            self.written += 1;
        }
        self.out.flush().map_err(|e| MergeError::io(&self.path, e))
    }

    /// Cierra el documento. Devuelve la cantidad de features escritas.
    pub(crate) fn finish(mut self) -> Result<usize, MergeError> {
        self.flush_batch()?;
        self.out
            .write_all(b"]}")
            .and_then(|_| self.out.flush())
            .map_err(|e| MergeError::io(&self.path, e))?;
        Ok(self.written)
    }
}

/// Lee un archivo GeoJSON que debe ser una FeatureCollection.
/// Un archivo vacío se lee como una colección sin features.
pub fn read_feature_collection(path: &Path) -> Result<FeatureCollection, MergeError> {
    let text = fs::read_to_string(path).map_err(|e| MergeError::io(path, e))?;
    if text.trim().is_empty() {
        return Ok(FeatureCollection {
            bbox: None,
            features: Vec::new(),
            foreign_members: None,
        });
    }
    let geojson: GeoJson = text.parse().map_err(|e| MergeError::GeoJson {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    match geojson {
        GeoJson::FeatureCollection(collection) => Ok(collection),
        _ => Err(MergeError::NotFeatureCollection {
            path: path.to_path_buf(),
        }),
    }
}

/* --------- Fusión de tablas --------- */

fn csv_error(path: &Path) -> impl Fn(csv::Error) -> MergeError + '_ {
    move |source| MergeError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Concatena CSVs con la misma cabecera. El primer archivo no vacío define el esquema.
/// Devuelve `None` si todos los archivos estaban vacíos.
fn merge_csv(table: &str, files: &[PathBuf], dest: &Path) -> Result<Option<(usize, usize)>, MergeError> {
    let mut writer: Option<(csv::Writer<File>, csv::StringRecord)> = None;
    let mut rows = 0;
    let mut dropped = 0;

    for path in files {
        let mut reader = csv::Reader::from_path(path).map_err(csv_error(path))?;
        let header = reader.headers().map_err(csv_error(path))?.clone();
        if header.is_empty() {
            dropped += 1;
            continue;
        }

        if writer.is_none() {
            let mut w = csv::Writer::from_path(dest).map_err(csv_error(dest))?;
            w.write_record(&header).map_err(csv_error(dest))?;
            writer = Some((w, header.clone()));
        }
        let Some((w, schema)) = writer.as_mut() else {
            continue;
        };
        if !schema.iter().eq(header.iter()) {
            return Err(MergeError::SchemaMismatch {
                table: table.to_string(),
                path: path.clone(),
            });
        }

        for record in reader.records() {
            let record = record.map_err(csv_error(path))?;
            w.write_record(&record).map_err(csv_error(dest))?;
            rows += 1;
        }
    }

    match writer {
        Some((mut w, _)) => {
            w.flush().map_err(|e| MergeError::io(dest, e))?;
            Ok(Some((rows, dropped)))
        }
        None => Ok(None),
    }
}

/// Concatena FeatureCollections. Las vacías (sin columnas) se descartan.
fn merge_geojson(files: &[PathBuf], dest: &Path) -> Result<Option<(usize, usize)>, MergeError> {
    let mut writer: Option<FeatureBatchWriter> = None;
    let mut dropped = 0;

    for path in files {
        let collection = read_feature_collection(path)?;
        if collection.features.is_empty() {
            debug!(file = %path.display(), "GeoJSON vacío, se descarta");
            dropped += 1;
            continue;
        }
        if writer.is_none() {
            writer = Some(FeatureBatchWriter::create(dest)?);
        }
        let Some(w) = writer.as_mut() else {
            continue;
        };
        for feature in collection.features {
            w.push(feature)?;
        }
    }

    match writer {
        Some(w) => Ok(Some((w.finish()?, dropped))),
        None => Ok(None),
    }
}

/// Agrupa los outputs parciales de `input_dir` por tabla y escribe una tabla
/// fusionada por grupo en `output_dir`.
///
/// `csv_tables` restringe (si viene) qué tablas CSV se fusionan.
pub fn merge_tabular(
    input_dir: &Path,
    output_dir: &Path,
    naming: &ResultNaming,
    csv_tables: Option<&[String]>,
) -> Result<Vec<MergedTable>, MergeError> {
    let mut groups: BTreeMap<(String, TableFormat), Vec<(usize, PathBuf)>> = BTreeMap::new();

    for entry in fs::read_dir(input_dir).map_err(|e| MergeError::io(input_dir, e))? {
        let entry = entry.map_err(|e| MergeError::io(input_dir, e))?;
        let file_name = entry.file_name();
        let Some(parsed) = naming.parse(&file_name.to_string_lossy()) else {
            continue;
        };
        if parsed.format == TableFormat::Csv {
            if let Some(filter) = csv_tables {
                if !filter.iter().any(|t| t.eq_ignore_ascii_case(&parsed.table)) {
                    continue;
                }
            }
        }
        groups
            .entry((parsed.table, parsed.format))
            .or_default()
            .push((parsed.partition, entry.path()));
    }

    fs::create_dir_all(output_dir).map_err(|e| MergeError::io(output_dir, e))?;

    let mut merged = Vec::new();
    for ((table, format), mut files) in groups {
        // la partición 0 crea la tabla destino
        files.sort();
        let paths: Vec<PathBuf> = files.into_iter().map(|(_, p)| p).collect();
        let dest = output_dir.join(format!("{}.{}", table, format.extension()));

        let outcome = match format {
            TableFormat::Csv => merge_csv(&table, &paths, &dest)?,
            TableFormat::GeoJson => merge_geojson(&paths, &dest)?,
        };
        let Some((rows, dropped)) = outcome else {
            info!(table = %table, files = paths.len(), "todos los archivos estaban vacíos, tabla omitida");
            continue;
        };

        info!(table = %table, rows, files = paths.len(), dropped, "tabla fusionada");
        merged.push(MergedTable {
            name: table,
            format,
            path: dest,
            rows,
            merged_files: paths.len() - dropped,
            dropped_files: dropped,
        });
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    const EMPTY_FC: &str = r#"{"type":"FeatureCollection","features":[]}"#;

    fn point_fc(ids: &[i64]) -> String {
        let features: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"type":"Feature","properties":{{"IDRECEIVER":{id}}},"geometry":{{"type":"Point","coordinates":[{id},0]}}}}"#
                )
            })
            .collect();
        format!(
            r#"{{"type":"FeatureCollection","features":[{}]}}"#,
            features.join(",")
        )
    }

    #[test]
    fn nombres_de_archivo_se_interpretan() {
        let naming = ResultNaming::default();
        assert_eq!(
            naming.parse("out_12_receiver_lden.geojson"),
            Some(ResultFileName {
                partition: 12,
                table: "RECEIVER_LDEN".into(),
                format: TableFormat::GeoJson,
            })
        );
        assert_eq!(naming.parse("out_x_TABLE.csv"), None);
        assert_eq!(naming.parse("joblog.txt"), None);
        assert_eq!(naming.parse("out_1_TABLE.shp"), None);
        assert_eq!(naming.partition_glob(3), "out_3_*");
    }

    #[test]
    fn merge_csv_suma_filas_y_descarta_vacios() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("results");
        let output = dir.path().join("results_post");
        fs::create_dir(&input).unwrap();

        write(&input, "out_0_STATS.csv", "ID,LEVEL\n1,50.5\n2,61.0\n");
        write(&input, "out_1_STATS.csv", "ID,LEVEL\n3,44.0\n");
        write(&input, "out_2_STATS.csv", "");

        let merged = merge_tabular(&input, &output, &ResultNaming::default(), None).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "STATS");
        assert_eq!(merged[0].rows, 3);
        assert_eq!(merged[0].dropped_files, 1);

        let text = fs::read_to_string(output.join("STATS.csv")).unwrap();
        assert_eq!(text, "ID,LEVEL\n1,50.5\n2,61.0\n3,44.0\n");
    }

    #[test]
    fn merge_csv_con_otro_esquema_falla() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "out_0_STATS.csv", "ID,LEVEL\n1,50\n");
        write(dir.path(), "out_1_STATS.csv", "ID,OTHER\n2,x\n");

        let err = merge_tabular(
            dir.path(),
            &dir.path().join("post"),
            &ResultNaming::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::SchemaMismatch { .. }));
    }

    #[test]
    fn filtro_de_tablas_csv() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "out_0_KEEP.csv", "A\n1\n");
        write(dir.path(), "out_0_SKIP.csv", "A\n1\n");

        let filter = vec!["keep".to_string()];
        let merged = merge_tabular(
            dir.path(),
            &dir.path().join("post"),
            &ResultNaming::default(),
            Some(&filter),
        )
        .unwrap();
        let names: Vec<&str> = merged.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["KEEP"]);
    }

    #[test]
    fn merge_geojson_concatena_y_descarta_colecciones_vacias() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("post");

        write(dir.path(), "out_0_RECEIVERS.geojson", EMPTY_FC);
        write(dir.path(), "out_1_RECEIVERS.geojson", &point_fc(&[1, 2]));
        write(dir.path(), "out_2_RECEIVERS.geojson", &point_fc(&[3]));

        let merged = merge_tabular(dir.path(), &output, &ResultNaming::default(), None).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].rows, 3);
        assert_eq!(merged[0].merged_files, 2);
        assert_eq!(merged[0].dropped_files, 1);

        let back = read_feature_collection(&output.join("RECEIVERS.geojson")).unwrap();
        assert_eq!(back.features.len(), 3);
        let first = back.features[0].properties.as_ref().unwrap();
        assert_eq!(first["IDRECEIVER"], serde_json::json!(1));
    }

    #[test]
    fn lotes_de_mas_de_cien_features() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<i64> = (0..250).collect();
        write(dir.path(), "out_0_BIG.geojson", &point_fc(&ids));

        let output = dir.path().join("post");
        let merged = merge_tabular(dir.path(), &output, &ResultNaming::default(), None).unwrap();
        assert_eq!(merged[0].rows, 250);
        let back = read_feature_collection(&output.join("BIG.geojson")).unwrap();
        assert_eq!(back.features.len(), 250);
    }

    #[test]
    fn tabla_con_todos_los_archivos_vacios_se_omite() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "out_0_NOTHING.geojson", EMPTY_FC);
        write(dir.path(), "out_1_NOTHING.geojson", "");

        let output = dir.path().join("post");
        let merged = merge_tabular(dir.path(), &output, &ResultNaming::default(), None).unwrap();
        assert!(merged.is_empty());
        assert!(!output.join("NOTHING.geojson").exists());
    }
}
