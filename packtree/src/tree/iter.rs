use super::{FindOps, Item, TreePath, TreeReader};
use crate::error::Result;
use crate::node::LeafEntry;

/// An in-order iterator over the elements of a container, starting at a position.
///
/// Walks leaf by leaf, keeping the entries of the current leaf. Stops after the first error.
pub struct Iter<'a> {
    reader: TreeReader<'a>,
    start: u64,
    state: IterState,
}

enum IterState {
    Pending,
    Leaf {
        path: TreePath,
        entries: Vec<LeafEntry>,
        idx: usize,
        sum_before: u64,
    },
    Done,
}

impl<'a> Iter<'a> {
    pub fn new(reader: TreeReader<'a>, pos: u64) -> Self {
        Iter {
            reader,
            start: pos,
            state: IterState::Pending,
        }
    }

    fn seek(&self) -> Result<IterState> {
        let located = self.reader.find_position(self.start)?;
        let leaf = self.reader.open_leaf(located.path.leaf())?;
        let entries = leaf.entries(0, leaf.size());
        Ok(IterState::Leaf {
            path: located.path,
            entries,
            idx: located.idx,
            sum_before: located.sum_before,
        })
    }

    fn step(&mut self) -> Result<Option<Item>> {
        if let IterState::Pending = self.state {
            self.state = self.seek()?;
        }
        loop {
            let IterState::Leaf {
                path,
                entries,
                idx,
                sum_before,
            } = &mut self.state
            else {
                return Ok(None);
            };

            if let Some(&entry) = entries.get(*idx) {
                *idx += 1;
                let item = Item::from_leaf(entry, *sum_before);
                *sum_before += entry.indexed();
                return Ok(Some(item));
            }

            let sum_before = *sum_before;
            let next = self.reader.next_leaf(path)?;
            self.state = match next {
                Some(next) => {
                    let leaf = self.reader.open_leaf(next.leaf())?;
                    IterState::Leaf {
                        entries: leaf.entries(0, leaf.size()),
                        path: next,
                        idx: 0,
                        sum_before,
                    }
                }
                None => IterState::Done,
            };
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(item) => item.map(Ok),
            Err(e) => {
                self.state = IterState::Done;
                Some(Err(e))
            }
        }
    }
}
