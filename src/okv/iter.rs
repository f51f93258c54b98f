//! A cursor over the ordered index. Materializes one node's sorted key
//! set at a time instead of the whole index, and walks across node
//! boundaries transparently on `next`/`previous`.

use crate::error::Result;

use super::db::Okv;

pub struct OkvIterator<'a> {
    okv: &'a Okv,
    node_idx: Option<usize>,
    keys: Vec<Vec<u8>>,
    pos: Option<usize>,
}

impl<'a> OkvIterator<'a> {
    pub(super) fn new(okv: &'a Okv) -> Self {
        OkvIterator {
            okv,
            node_idx: None,
            keys: Vec::new(),
            pos: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pos.is_some()
    }

    pub fn get_key(&self) -> Option<&[u8]> {
        self.pos.map(|p| self.keys[p].as_slice())
    }

    pub fn seek_first(&mut self) -> Result<()> {
        self.load_forward_from(0)
    }

    pub fn seek_last(&mut self) -> Result<()> {
        let last = self.okv.node_count().saturating_sub(1);
        self.load_backward_from(last)
    }

    /// Positions on the smallest key `>= key` (an exact match counts),
    /// or invalidates the cursor if none exists.
    pub fn seek_after(&mut self, key: &[u8]) -> Result<()> {
        let mut idx = self.okv.find_node_index(key);
        loop {
            if idx >= self.okv.node_count() {
                self.invalidate();
                return Ok(());
            }
            let keys = self.okv.materialize_node_sorted(idx)?;
            let mut p = keys.partition_point(|k| k.as_slice() < key);
            while p < keys.len() && keys[p].as_slice() < key {
                p += 1;
            }
            if p < keys.len() {
                self.node_idx = Some(idx);
                self.pos = Some(p);
                self.keys = keys;
                return Ok(());
            }
            idx += 1;
        }
    }

    pub fn next(&mut self) -> Result<()> {
        match (self.node_idx, self.pos) {
            (Some(_), Some(p)) if p + 1 < self.keys.len() => {
                self.pos = Some(p + 1);
                Ok(())
            }
            (Some(idx), Some(_)) => self.load_forward_from(idx + 1),
            _ => Ok(()),
        }
    }

    pub fn previous(&mut self) -> Result<()> {
        match (self.node_idx, self.pos) {
            (Some(_), Some(p)) if p > 0 => {
                self.pos = Some(p - 1);
                Ok(())
            }
            (Some(0), Some(_)) => {
                self.invalidate();
                Ok(())
            }
            (Some(idx), Some(_)) => self.load_backward_from(idx - 1),
            _ => Ok(()),
        }
    }

    fn invalidate(&mut self) {
        self.node_idx = None;
        self.keys.clear();
        self.pos = None;
    }

    fn load_forward_from(&mut self, mut idx: usize) -> Result<()> {
        while idx < self.okv.node_count() {
            let keys = self.okv.materialize_node_sorted(idx)?;
            if !keys.is_empty() {
                self.node_idx = Some(idx);
                self.pos = Some(0);
                self.keys = keys;
                return Ok(());
            }
            idx += 1;
        }
        self.invalidate();
        Ok(())
    }

    fn load_backward_from(&mut self, mut idx: usize) -> Result<()> {
        if self.okv.node_count() == 0 {
            self.invalidate();
            return Ok(());
        }
        loop {
            let keys = self.okv.materialize_node_sorted(idx)?;
            if !keys.is_empty() {
                self.node_idx = Some(idx);
                self.pos = Some(keys.len() - 1);
                self.keys = keys;
                return Ok(());
            }
            if idx == 0 {
                self.invalidate();
                return Ok(());
            }
            idx -= 1;
        }
    }
}
