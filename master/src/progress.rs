use std::sync::{Arc, Mutex, PoisonError};

/// Recibe el avance de una etapa larga, como fracción 0..=1.
pub trait ProgressReporter: Send + Sync {
    fn report_progress(&self, fraction: f64);

    /// Escribe lo que haya quedado retenido.
    fn flush(&self) {}
}

/// Reporter que descarta todo.
#[cfg(test)]
pub struct NoProgress;

#[cfg(test)]
impl ProgressReporter for NoProgress {
    fn report_progress(&self, _fraction: f64) {}
}

struct StageState {
    completed: usize,
    last_reported: f64,
}

/// Avance por etapas fijas: cada etapa vale lo mismo sin importar lo que tarde.
/// Nunca reporta un valor menor al anterior.
pub struct StageProgress {
    sink: Arc<dyn ProgressReporter>,
    total: usize,
    state: Mutex<StageState>,
}

impl StageProgress {
    pub fn new(sink: Arc<dyn ProgressReporter>, total: usize) -> Self {
        Self {
            sink,
            total: total.max(1),
            state: Mutex::new(StageState {
                completed: 0,
                last_reported: 0.0,
            }),
        }
    }

    fn report(&self, state: &mut StageState, fraction: f64) {
        if fraction > state.last_reported {
            state.last_reported = fraction;
            self.sink.report_progress(fraction);
        }
    }

    /// Marca la etapa actual como terminada.
    pub fn stage_done(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.completed = (state.completed + 1).min(self.total);
        let fraction = state.completed as f64 / self.total as f64;
        self.report(&mut state, fraction);
        drop(state);
        self.sink.flush();
    }
}

/// Avance dentro de la etapa en curso.
impl ProgressReporter for StageProgress {
    fn report_progress(&self, fraction: f64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let within = fraction.clamp(0.0, 1.0);
        let overall = (state.completed as f64 + within) / self.total as f64;
        self.report(&mut state, overall.min(1.0));
    }

    fn flush(&self) {
        self.sink.flush();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Guarda todo lo reportado.
    #[derive(Default)]
    pub(crate) struct RecordingProgress {
        pub values: Mutex<Vec<f64>>,
        pub flushes: Mutex<usize>,
    }

    impl ProgressReporter for RecordingProgress {
        fn report_progress(&self, fraction: f64) {
            self.values.lock().unwrap().push(fraction);
        }

        fn flush(&self) {
            *self.flushes.lock().unwrap() += 1;
        }
    }

    #[test]
    fn etapas_avanzan_en_pasos_fijos_y_nunca_retroceden() {
        let sink = Arc::new(RecordingProgress::default());
        let progress = StageProgress::new(sink.clone(), 4);

        progress.stage_done();
        progress.report_progress(0.5);
        progress.report_progress(0.2); // retrocede: se ignora
        progress.stage_done();
        progress.stage_done();
        progress.stage_done();
        progress.stage_done(); // de más: se queda en 1.0

        let values = sink.values.lock().unwrap().clone();
        assert_eq!(values, vec![0.25, 0.375, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn fin_de_etapa_vacia_lo_retenido() {
        let sink = Arc::new(RecordingProgress::default());
        let progress = StageProgress::new(sink.clone(), 2);

        progress.report_progress(0.3);
        assert_eq!(*sink.flushes.lock().unwrap(), 0);
        progress.stage_done();
        progress.stage_done();
        assert_eq!(*sink.flushes.lock().unwrap(), 2);
    }
}
