use parking_lot::Mutex;
use std::sync::Arc;

/// État partagé entre le scheduler, l'orchestrateur et les handlers HTTP.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Copie de lecture : le verrou n'est jamais tenu au-delà du clone.
pub fn read_copy<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}
