//! Three-slot (`load` / `compute` / `flush`) pipeline controller (spec
//! §4.11). Workers acquire slots in strict order and release them only
//! after handing off the relevant buffer, producing a steady-state
//! pipeline where tile *N* flushes while *N*+1 computes and *N*+2 loads.

use std::sync::{Condvar, Mutex};

use crate::error::OligoResult;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    Load,
    Compute,
    Flush,
}

struct Slots {
    load_busy: bool,
    compute_busy: bool,
    flush_busy: bool,
    /// Set once any worker has raised a fatal error; the controller stops
    /// handing out slots once it's `Some`.
    fatal: Option<String>,
}

/// A tile to process, ordered length-descending by the controller's queue
/// (longer reads first, spec §4.11: "to make memory usage predictable").
pub struct Tile {
    pub id: u32,
    pub read_length: u32,
}

/// The three-slot controller. `load`, `compute`, and `flush` are user
/// callbacks invoked while holding the matching slot; each returns the
/// value handed to the next stage.
pub struct PipelineController<L, C, F, LoadOut, ComputeOut>
where
    L: Fn(&Tile) -> OligoResult<LoadOut> + Sync,
    C: Fn(&Tile, LoadOut) -> OligoResult<ComputeOut> + Sync,
    F: Fn(&Tile, ComputeOut) -> OligoResult<()> + Sync,
{
    slots: Mutex<Slots>,
    condvar: Condvar,
    load: L,
    compute: C,
    flush: F,
}

impl<L, C, F, LoadOut, ComputeOut> PipelineController<L, C, F, LoadOut, ComputeOut>
where
    L: Fn(&Tile) -> OligoResult<LoadOut> + Sync,
    C: Fn(&Tile, LoadOut) -> OligoResult<ComputeOut> + Sync,
    F: Fn(&Tile, ComputeOut) -> OligoResult<()> + Sync,
{
    pub fn new(load: L, compute: C, flush: F) -> Self {
        PipelineController {
            slots: Mutex::new(Slots { load_busy: false, compute_busy: false, flush_busy: false, fatal: None }),
            condvar: Condvar::new(),
            load,
            compute,
            flush,
        }
    }

    fn acquire(&self, slot: Slot) -> Result<(), ()> {
        let mut guard = self.slots.lock().unwrap();
        loop {
            if guard.fatal.is_some() {
                return Err(());
            }
            let busy = match slot {
                Slot::Load => guard.load_busy,
                Slot::Compute => guard.compute_busy,
                Slot::Flush => guard.flush_busy,
            };
            if !busy {
                match slot {
                    Slot::Load => guard.load_busy = true,
                    Slot::Compute => guard.compute_busy = true,
                    Slot::Flush => guard.flush_busy = true,
                }
                return Ok(());
            }
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    fn release(&self, slot: Slot) {
        let mut guard = self.slots.lock().unwrap();
        match slot {
            Slot::Load => guard.load_busy = false,
            Slot::Compute => guard.compute_busy = false,
            Slot::Flush => guard.flush_busy = false,
        }
        self.condvar.notify_all();
    }

    fn mark_fatal(&self, message: String) {
        let mut guard = self.slots.lock().unwrap();
        if guard.fatal.is_none() {
            guard.fatal = Some(message);
        }
        self.condvar.notify_all();
    }

    /// Runs every tile in `tiles` (assumed already length-descending)
    /// through load → compute → flush. No cooperative cancellation: the
    /// first fatal error recorded stops every worker from acquiring new
    /// slots, and the error is returned to the caller, which is expected
    /// to exit the process with a non-zero code (spec §4.11, §7).
    pub fn run_tiles(&self, tiles: &[Tile]) -> OligoResult<()> {
        for tile in tiles {
            if self.acquire(Slot::Load).is_err() {
                break;
            }
            let loaded = match (self.load)(tile) {
                Ok(v) => v,
                Err(e) => {
                    self.release(Slot::Load);
                    self.mark_fatal(e.to_string());
                    return Err(e);
                }
            };
            self.release(Slot::Load);

            if self.acquire(Slot::Compute).is_err() {
                break;
            }
            let computed = match (self.compute)(tile, loaded) {
                Ok(v) => v,
                Err(e) => {
                    self.release(Slot::Compute);
                    self.mark_fatal(e.to_string());
                    return Err(e);
                }
            };
            self.release(Slot::Compute);

            if self.acquire(Slot::Flush).is_err() {
                break;
            }
            let flushed = (self.flush)(tile, computed);
            self.release(Slot::Flush);
            if let Err(e) = flushed {
                self.mark_fatal(e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Orders a tile queue length-descending, per spec §4.11.
pub fn order_tiles(mut tiles: Vec<Tile>) -> Vec<Tile> {
    tiles.sort_by(|a, b| b.read_length.cmp(&a.read_length));
    tiles
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::OligoError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn runs_tiles_through_all_three_stages() {
        let loaded_count = AtomicU32::new(0);
        let computed_count = AtomicU32::new(0);
        let flushed_count = AtomicU32::new(0);

        let controller = PipelineController::new(
            |_tile: &Tile| -> OligoResult<u32> {
                loaded_count.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            },
            |_tile: &Tile, loaded: u32| -> OligoResult<u32> {
                computed_count.fetch_add(1, Ordering::SeqCst);
                Ok(loaded * 2)
            },
            |_tile: &Tile, _computed: u32| -> OligoResult<()> {
                flushed_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let tiles = vec![Tile { id: 0, read_length: 100 }, Tile { id: 1, read_length: 50 }];
        controller.run_tiles(&tiles).unwrap();

        assert_eq!(loaded_count.load(Ordering::SeqCst), 2);
        assert_eq!(computed_count.load(Ordering::SeqCst), 2);
        assert_eq!(flushed_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stops_on_first_fatal_error() {
        let processed = AtomicU32::new(0);
        let controller = PipelineController::new(
            |tile: &Tile| -> OligoResult<u32> {
                processed.fetch_add(1, Ordering::SeqCst);
                if tile.id == 1 {
                    Err(OligoError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom")))
                } else {
                    Ok(0)
                }
            },
            |_tile: &Tile, loaded: u32| -> OligoResult<u32> { Ok(loaded) },
            |_tile: &Tile, _computed: u32| -> OligoResult<()> { Ok(()) },
        );

        let tiles = vec![Tile { id: 0, read_length: 100 }, Tile { id: 1, read_length: 50 }, Tile { id: 2, read_length: 10 }];
        let result = controller.run_tiles(&tiles);
        assert!(result.is_err());
        assert!(processed.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn order_tiles_sorts_length_descending() {
        let tiles = vec![Tile { id: 0, read_length: 50 }, Tile { id: 1, read_length: 150 }, Tile { id: 2, read_length: 100 }];
        let ordered = order_tiles(tiles);
        assert_eq!(ordered.iter().map(|t| t.read_length).collect::<Vec<_>>(), vec![150, 100, 50]);
    }
}
