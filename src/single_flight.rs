//! Single-Flight Guard
//!
//! Eine Zelle, die höchstens eine laufende Operation hält. Gleichzeitige
//! Aufrufer teilen sich das Ergebnis der laufenden Operation statt eine
//! zweite zu starten.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

struct Flight<T, E> {
    id: u64,
    future: Shared<BoxFuture<'static, Result<T, E>>>,
}

pub struct SingleFlight<T, E> {
    slot: Mutex<Option<Flight<T, E>>>,
    next_id: Mutex<u64>,
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: Mutex::new(0),
        }
    }

    /// Führt `start` aus, falls keine Operation läuft; sonst wird auf die
    /// laufende gewartet.
    ///
    /// Nach Abschluss ist die Zelle wieder leer. Wird ein Aufrufer vor dem
    /// Abschluss abgebrochen, übernimmt der nächste Aufrufer das Pollen.
    pub async fn run<F>(&self, start: F) -> Result<T, E>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, E>>,
    {
        let (id, future) = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(flight) => (flight.id, flight.future.clone()),
                None => {
                    let id = {
                        let mut next = self.next_id.lock();
                        *next += 1;
                        *next
                    };
                    let future = start().shared();
                    *slot = Some(Flight {
                        id,
                        future: future.clone(),
                    });
                    (id, future)
                }
            }
        };

        let result = future.await;

        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|flight| flight.id == id) {
            *slot = None;
        }

        result
    }

    /// Löst die laufende Operation von der Zelle
    ///
    /// Wer bereits wartet, bekommt weiterhin deren Ergebnis; der nächste
    /// Aufruf von `run` startet eine neue Operation.
    pub fn forget(&self) {
        self.slot.lock().take();
    }

    /// Prüft ob gerade eine Operation läuft
    pub fn is_in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
