//! Read-modify-write cache of 16-bit words
//!
//! Partial writes (bit fields, single words of multi-word values) keep the
//! unwritten bits from the last known word contents. Range reads refresh
//! the cache; a write stages its words in a [`TentativeWrite`] that is
//! committed only after the device acknowledged every request.

use std::collections::HashMap;

use crate::register::RegisterType;

type CacheKey = (RegisterType, u32);

fn key(reg_type: RegisterType, address: u32) -> CacheKey {
    // all holding flavours address the same table
    let reg_type = match reg_type {
        RegisterType::HoldingSingle | RegisterType::HoldingMulti => RegisterType::Holding,
        other => other,
    };
    (reg_type, address)
}

#[derive(Debug, Default, Clone)]
pub struct RegisterCache {
    words: HashMap<CacheKey, u16>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg_type: RegisterType, address: u32) -> Option<u16> {
        self.words.get(&key(reg_type, address)).copied()
    }

    pub fn insert(&mut self, reg_type: RegisterType, address: u32, word: u16) {
        self.words.insert(key(reg_type, address), word);
    }

    /// Cached words starting at `address`, missing words read as 0
    pub fn words(&self, reg_type: RegisterType, address: u32, count: u16) -> Vec<u16> {
        (0..u32::from(count))
            .map(|i| self.get(reg_type, address + i).unwrap_or(0))
            .collect()
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Words staged by one write, invisible until committed
#[derive(Debug, Default)]
pub struct TentativeWrite {
    words: HashMap<CacheKey, u16>,
}

impl TentativeWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, reg_type: RegisterType, address: u32, word: u16) {
        self.words.insert(key(reg_type, address), word);
    }

    pub fn commit(self, cache: &mut RegisterCache) {
        cache.words.extend(self.words);
    }
}
