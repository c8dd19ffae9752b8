//! Fusión de los resultados parciales de cada partición.
//!
//! Primero se concatenan las tablas con el mismo nombre (CSV y GeoJSON),
//! después cada tabla de isófonas se vuelve a sumar sobre una grilla para
//! eliminar los cortes entre particiones.

pub mod exposure;
pub mod noise;
pub mod tabular;

use std::path::{Path, PathBuf};

use tracing::info;

pub use exposure::{merge_classified_polygons, reduce_classified, ExposureSummary, GridSpec, MergedCell};
pub use tabular::{merge_tabular, MergedTable, ResultNaming, TableFormat};

use crate::error::MergeError;

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub grid: GridSpec,
    /// Columna con la etiqueta de banda (ej: NOISELEVEL)
    pub classification_field: String,
    pub naming: ResultNaming,
    /// Si viene, sólo estas tablas CSV se fusionan
    pub csv_tables: Option<Vec<String>>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            grid: GridSpec::default(),
            classification_field: "NOISELEVEL".into(),
            naming: ResultNaming::default(),
            csv_tables: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub tables: Vec<MergedTable>,
    pub exposures: Vec<ExposureSummary>,
}

impl MergeReport {
    pub fn output_files(&self) -> Vec<PathBuf> {
        self.tables
            .iter()
            .map(|t| t.path.clone())
            .chain(self.exposures.iter().map(|e| e.output.clone()))
            .collect()
    }
}

/// Fusiona todo lo que dejaron las particiones en `input_dir` y escribe las
/// tablas finales en `output_dir`.
pub fn merge_results(
    input_dir: &Path,
    output_dir: &Path,
    settings: &MergeSettings,
) -> Result<MergeReport, MergeError> {
    let tables = merge_tabular(
        input_dir,
        output_dir,
        &settings.naming,
        settings.csv_tables.as_deref(),
    )?;

    let mut exposures = Vec::new();
    for table in tables.iter().filter(|t| t.format == TableFormat::GeoJson) {
        if let Some(summary) = merge_classified_polygons(
            &table.name,
            &table.path,
            output_dir,
            &settings.grid,
            &settings.classification_field,
        )? {
            exposures.push(summary);
        }
    }

    info!(
        tables = tables.len(),
        exposures = exposures.len(),
        "fusión de resultados terminada"
    );
    Ok(MergeReport { tables, exposures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn iso(x1: i32, x2: i32, label: &str) -> String {
        format!(
            r#"{{"type":"Feature","properties":{{"NOISELEVEL":"{label}"}},"geometry":{{"type":"Polygon","coordinates":[[[{x1},0],[{x2},0],[{x2},10],[{x1},10],[{x1},0]]]}}}}"#
        )
    }

    #[test]
    fn merge_results_une_isofonas_cortadas_por_particion() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("results");
        let output = dir.path().join("results_post");
        fs::create_dir(&input).unwrap();

        // el mismo polígono quedó cortado en x=10 por dos particiones
        fs::write(
            input.join("out_0_CBS_A_R_LD_FR.geojson"),
            format!(r#"{{"type":"FeatureCollection","features":[{}]}}"#, iso(0, 10, "Lden6064")),
        )
        .unwrap();
        fs::write(
            input.join("out_1_CBS_A_R_LD_FR.geojson"),
            format!(r#"{{"type":"FeatureCollection","features":[{}]}}"#, iso(10, 20, "Lden6064")),
        )
        .unwrap();
        fs::write(input.join("out_0_STATS.csv"), "A,B\n1,2\n").unwrap();
        fs::write(input.join("out_1_STATS.csv"), "A,B\n3,4\n").unwrap();

        let report = merge_results(&input, &output, &MergeSettings::default()).unwrap();
        assert_eq!(report.tables.len(), 2);
        assert_eq!(report.exposures.len(), 1);
        assert_eq!(report.exposures[0].output_features, 1);

        let files = report.output_files();
        assert!(files.contains(&output.join("CBS_A_R_LD_FR.geojson")));
        assert!(files.contains(&output.join("CBS_A_R_LD_FR_MERGED.geojson")));
        assert!(files.contains(&output.join("STATS.csv")));
    }

    #[test]
    fn merge_results_suma_particiones_en_potencia() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("results");
        let output = dir.path().join("results_post");
        fs::create_dir(&input).unwrap();

        // dos fuentes de 57 dB sobre la misma celda, calculadas en particiones distintas
        for node in 0..2 {
            fs::write(
                input.join(format!("out_{node}_CBS_A_R_LD_FR.geojson")),
                format!(r#"{{"type":"FeatureCollection","features":[{}]}}"#, iso(0, 10, "Lden5559")),
            )
            .unwrap();
        }

        let report = merge_results(&input, &output, &MergeSettings::default()).unwrap();
        assert_eq!(report.exposures.len(), 1);
        assert_eq!(report.exposures[0].input_polygons, 2);

        // 57 ⊕ 57 = 60.01 dB: banda 60-64, no la 55-59 que daría un promedio
        let merged = tabular::read_feature_collection(&report.exposures[0].output).unwrap();
        assert_eq!(merged.features.len(), 1);
        let props = merged.features[0].properties.as_ref().unwrap();
        assert_eq!(props["NOISELEVEL"], serde_json::json!("Lden6064"));
    }
}
