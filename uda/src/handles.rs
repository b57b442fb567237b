use log::trace;

use crate::block::DataBlock;
use crate::errors::{Result, UdaError};
use crate::protocol::{CLIENTFLAG_FREEREUSELASTHANDLE, CLIENTFLAG_REUSELASTHANDLE};

/// Non-negative index into the process-local DataBlock table.
pub type Handle = i32;

/// The result store. A slot is live exactly when `block.handle` equals its
/// index; freed slots carry -1 and are reassigned before the table grows.
#[derive(Default)]
pub struct HandleTable {
    blocks: Vec<DataBlock>,
    last_handle: Option<usize>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a slot for a new result and returns its handle.
    ///
    /// With REUSELASTHANDLE the previously issued slot is reinitialised in
    /// place; with FREEREUSELASTHANDLE its heap is released first. Otherwise
    /// the first free slot is reassigned, and the table grows only when none
    /// is free.
    pub fn acquire(&mut self, flags: u32) -> Handle {
        if flags & (CLIENTFLAG_REUSELASTHANDLE | CLIENTFLAG_FREEREUSELASTHANDLE) != 0 {
            if let Some(last) = self.last_handle {
                if self.blocks.get(last).map(|b| b.handle >= 0).unwrap_or(false) {
                    if flags & CLIENTFLAG_FREEREUSELASTHANDLE != 0 {
                        self.blocks[last].reset();
                    } else {
                        // The caller owns whatever the slot still holds; the
                        // incoming assignment releases it.
                        self.blocks[last] = DataBlock::new();
                    }
                    self.blocks[last].handle = last as Handle;
                    trace!("handle {last} reissued");
                    return last as Handle;
                }
            }
        }

        let index = match self.blocks.iter().position(|b| b.handle < 0) {
            Some(free) => free,
            None => {
                self.blocks.push(DataBlock::new());
                self.blocks.len() - 1
            }
        };
        self.blocks[index] = DataBlock::new();
        self.blocks[index].handle = index as Handle;
        self.last_handle = Some(index);
        trace!("handle {index} issued");
        index as Handle
    }

    pub fn get(&self, handle: Handle) -> Result<&DataBlock> {
        self.blocks
            .get(handle.max(0) as usize)
            .filter(|b| handle >= 0 && b.handle == handle)
            .ok_or(UdaError::MissingHandle(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut DataBlock> {
        self.blocks
            .get_mut(handle.max(0) as usize)
            .filter(|b| handle >= 0 && b.handle == handle)
            .ok_or(UdaError::MissingHandle(handle))
    }

    /// Stores a completed result into a slot.
    pub fn store(&mut self, handle: Handle, mut block: DataBlock) -> Result<()> {
        block.handle = handle;
        let slot = self.get_mut(handle)?;
        *slot = block;
        Ok(())
    }

    /// Releases the slot's heap and returns it to the pool.
    pub fn free(&mut self, handle: Handle) {
        if handle < 0 {
            return;
        }
        if let Some(block) = self.blocks.get_mut(handle as usize) {
            block.reset();
        }
        if self.last_handle == Some(handle as usize) {
            self.last_handle = None;
        }
    }

    pub fn free_all(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
        self.last_handle = None;
    }

    /// The number of live slots.
    pub fn live(&self) -> usize {
        self.blocks.iter().filter(|b| b.handle >= 0).count()
    }

    pub fn last_handle(&self) -> Option<Handle> {
        self.last_handle.map(|h| h as Handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_equal_their_table_index() {
        let mut table = HandleTable::new();
        for expected in 0..4 {
            let handle = table.acquire(0);
            assert_eq!(handle, expected);
            assert_eq!(table.get(handle).unwrap().handle, handle);
        }
    }

    #[test]
    fn freed_slots_are_reassigned_first() {
        let mut table = HandleTable::new();
        let a = table.acquire(0);
        let b = table.acquire(0);
        let c = table.acquire(0);
        table.free(b);
        assert!(table.get(b).is_err());
        let again = table.acquire(0);
        assert_eq!(again, b);
        assert_eq!(table.live(), 3);
        let _ = (a, c);
    }

    #[test]
    fn reuse_last_handle_reissues_the_same_slot() {
        let mut table = HandleTable::new();
        let first = table.acquire(0);
        let mut block = DataBlock::new();
        block.set_data_f64(&[1.0, 2.0]);
        table.store(first, block).unwrap();

        let again = table.acquire(CLIENTFLAG_REUSELASTHANDLE);
        assert_eq!(again, first);
        assert!(table.get(again).unwrap().data.is_empty());

        let freed = table.acquire(CLIENTFLAG_FREEREUSELASTHANDLE);
        assert_eq!(freed, first);
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn no_two_live_blocks_share_an_index() {
        let mut table = HandleTable::new();
        let handles: Vec<_> = (0..8).map(|_| table.acquire(0)).collect();
        let mut seen = std::collections::HashSet::new();
        for h in handles {
            assert!(seen.insert(h));
        }
    }
}
