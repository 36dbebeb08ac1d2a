use std::sync::{Arc, Mutex};

use rekam_rs::circuit::Circuit;
use rekam_rs::edit::EditResult;
use rekam_rs::state::SimAccess;

use crate::model::TraceModel;

/// Explicit map from simulation-state identity to its trace model, owned by
/// whatever manages simulator lifecycles: models are created on first use and
/// torn down with their state, never retained by a process-wide registry.
#[derive(Default)]
pub struct ModelCache {
    entries: Vec<Entry>,
}

struct Entry {
    sim: Arc<dyn SimAccess>,
    model: Arc<Mutex<TraceModel>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sim: &Arc<dyn SimAccess>) -> Option<Arc<Mutex<TraceModel>>> {
        self.entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.sim, sim))
            .map(|e| Arc::clone(&e.model))
    }

    /// The model for `sim`, created against `circuit` on first use.
    pub fn model_for(
        &mut self,
        circuit: &Arc<Circuit>,
        sim: &Arc<dyn SimAccess>,
    ) -> Arc<Mutex<TraceModel>> {
        if let Some(model) = self.get(sim) {
            return model;
        }
        let model = Arc::new(Mutex::new(TraceModel::new(
            Arc::clone(circuit),
            Arc::clone(sim),
        )));
        self.entries.push(Entry {
            sim: Arc::clone(sim),
            model: Arc::clone(&model),
        });
        model
    }

    /// Tears the model down with its simulation state; deselecting stops the
    /// background writer.
    pub fn dispose(&mut self, sim: &Arc<dyn SimAccess>) {
        if let Some(i) = self.entries.iter().position(|e| Arc::ptr_eq(&e.sim, sim)) {
            let entry = self.entries.remove(i);
            entry.model.lock().unwrap().set_selected(false);
        }
    }

    /// Forwards one committed edit to every live model.
    pub fn circuit_edited(&self, edit: &EditResult) {
        for entry in &self.entries {
            entry.model.lock().unwrap().circuit_edited(edit);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rekam_rs::circuit::Circuit;
    use rekam_rs::state::SimAccess;

    use crate::fixture::{pin, FakeSim};

    use super::ModelCache;

    #[test]
    fn test_create_on_miss_and_dispose() {
        let a = pin("a", 1, true, 0, 0);
        let top = Circuit::new("top", vec![a]);
        let sim: Arc<dyn SimAccess> = Arc::new(FakeSim::default());
        let other: Arc<dyn SimAccess> = Arc::new(FakeSim::default());

        let mut cache = ModelCache::new();
        assert!(cache.get(&sim).is_none());

        let model = cache.model_for(&top, &sim);
        assert!(Arc::ptr_eq(&cache.model_for(&top, &sim), &model));
        assert_eq!(cache.len(), 1);

        let second = cache.model_for(&top, &other);
        assert!(!Arc::ptr_eq(&second, &model));
        assert_eq!(cache.len(), 2);

        cache.dispose(&sim);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&sim).is_none());
    }
}
