use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errores de la fusión de resultados parciales.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("error de E/S en {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CSV inválido en {path}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("GeoJSON inválido en {path}")]
    GeoJson {
        path: PathBuf,
        #[source]
        source: Box<geojson::Error>,
    },

    #[error("el archivo {path} no es una FeatureCollection")]
    NotFeatureCollection { path: PathBuf },

    #[error("la tabla {table} recibió un archivo con otro esquema: {path}")]
    SchemaMismatch { table: String, path: PathBuf },

    #[error("tamaño de grilla inválido: celda={cell_size}, celda principal={main_cell_size}")]
    InvalidGrid { cell_size: f64, main_cell_size: f64 },

    #[error("error serializando {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl MergeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MergeError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errores al construir o leer la configuración de particiones.
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("error de E/S en {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuración de particiones inválida en {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("GeoJSON de fuentes inválido en {path}")]
    GeoJson {
        path: PathBuf,
        #[source]
        source: Box<geojson::Error>,
    },

    #[error("no existe partición para el nodo {0}")]
    UnknownNode(usize),

    #[error("no hay unidades de trabajo para repartir")]
    EmptyWorkload,
}
