//! Niveles sonoros: conversión dB <-> potencia y bandas de exposición.

/// Decibeles a potencia lineal (W relativo).
pub fn db_to_w(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Potencia lineal a decibeles.
pub fn w_to_db(w: f64) -> f64 {
    10.0 * w.log10()
}

/// Periodo de una tabla de exposición; cada uno tiene su escala de bandas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// Lden
    Day,
    /// Lnight
    Night,
}

impl Period {
    /// Tablas `_LD_` son de día. Si el nombre no lo dice, decide la primera etiqueta.
    pub fn detect(table: &str, first_label: Option<&str>) -> Period {
        if table.contains("_LD_") || first_label.is_some_and(|l| l.starts_with("Lden")) {
            Period::Day
        } else {
            Period::Night
        }
    }
}

const REFERENCE_LEVELS: &[(&str, f64)] = &[
    ("Lden5559", 57.0),
    ("Lden6064", 62.0),
    ("Lden6569", 67.0),
    ("Lden7074", 72.0),
    ("LdenGreaterThan75", 75.0),
    ("Lnight5054", 52.0),
    ("Lnight5559", 57.0),
    ("Lnight6064", 62.0),
    ("Lnight6569", 67.0),
    ("LnightGreaterThan70", 70.0),
];

/// Nivel de referencia (dB) de una etiqueta de banda. `None` si no se conoce.
pub fn reference_level(label: &str) -> Option<f64> {
    REFERENCE_LEVELS
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, db)| *db)
}

/// Banda que corresponde a un nivel en dB según el periodo.
pub fn classify(period: Period, db: f64) -> &'static str {
    match period {
        Period::Day => {
            if db < 60.0 {
                "Lden5559"
            } else if db < 65.0 {
                "Lden6064"
            } else if db < 70.0 {
                "Lden6569"
            } else if db < 75.0 {
                "Lden7074"
            } else {
                "LdenGreaterThan75"
            }
        }
        Period::Night => {
            if db < 55.0 {
                "Lnight5054"
            } else if db < 60.0 {
                "Lnight5559"
            } else if db < 65.0 {
                "Lnight6064"
            } else if db < 70.0 {
                "Lnight6569"
            } else {
                "LnightGreaterThan70"
            }
        }
    }
}

/// Suma de niveles ponderados por la fracción de celda que cubren.
/// La suma se hace en potencia, nunca en dB. `None` si no hay energía.
pub fn sum_weighted_levels<I>(levels: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let power: f64 = levels
        .into_iter()
        .map(|(db, fraction)| db_to_w(db) * fraction)
        .sum();
    (power > 0.0).then(|| w_to_db(power))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_db_potencia_es_reversible() {
        for db in [30.0, 57.0, 62.5, 80.0] {
            assert!((w_to_db(db_to_w(db)) - db).abs() < 1e-9);
        }
    }

    #[test]
    fn dos_fragmentos_que_cubren_la_celda_suman_en_potencia() {
        let db = sum_weighted_levels([(57.0, 1.0), (60.0, 1.0)]).unwrap();
        assert!((db - 61.76).abs() < 0.01, "db={db}");
        assert_eq!(classify(Period::Day, db), "Lden6064");

        // el promedio aritmético daría 58.5 dB, otra banda
        assert_eq!(classify(Period::Day, (57.0 + 60.0) / 2.0), "Lden5559");
    }

    #[test]
    fn mitad_y_mitad_se_pondera_por_area() {
        let db = sum_weighted_levels([(57.0, 0.5), (62.0, 0.5)]).unwrap();
        assert!((db - 60.18).abs() < 0.01, "db={db}");
        assert_eq!(classify(Period::Day, db), "Lden6064");
        assert_eq!(classify(Period::Day, (57.0 + 62.0) / 2.0), "Lden5559");
    }

    #[test]
    fn sin_energia_no_hay_nivel() {
        assert_eq!(sum_weighted_levels(Vec::new()), None);
        assert_eq!(sum_weighted_levels([(60.0, 0.0)]), None);
    }

    #[test]
    fn escalas_de_dia_y_noche() {
        assert_eq!(classify(Period::Day, 59.99), "Lden5559");
        assert_eq!(classify(Period::Day, 75.0), "LdenGreaterThan75");
        assert_eq!(classify(Period::Night, 54.0), "Lnight5054");
        assert_eq!(classify(Period::Night, 72.0), "LnightGreaterThan70");
        assert_eq!(reference_level("Lnight6064"), Some(62.0));
        assert_eq!(reference_level("LdenGreaterThan55"), None);
        assert_eq!(Period::detect("CBS_A_R_LD_FR", None), Period::Day);
        assert_eq!(Period::detect("CBS_A_R_LN_FR", Some("Lnight5054")), Period::Night);
        assert_eq!(Period::detect("EXPO", Some("Lden6064")), Period::Day);
    }
}
