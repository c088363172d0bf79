// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/memmgt.rs

// Memory management for KESTREL. A fixed pool of uniform cells with a
// threaded free list, a mark and sweep collector over an explicit
// root set, and a sliding compactor used before persisting an image.

// <>

use super::{
    core::{Cell, Obj},
    LispErr,
};

/// Fixed-capacity pool of cells addressed by index
///
/// The pool never grows. Cells are identified only through Obj
/// handles, so the backing store can be swapped without touching any
/// code outside this module.
#[derive(Clone)]
pub struct Arena {
    cells: Vec<Cell>,
    marks: Vec<bool>,
    free_list: Obj,
    free_count: usize,
}

impl Arena {
    /// Creates a pool of the given cell count with every cell free
    pub fn new(capacity: usize) -> Self {
        let mut arena = Arena {
            cells: vec![Cell::Free { next: Obj::NIL }; capacity],
            marks: vec![false; capacity],
            free_list: Obj::NIL,
            free_count: 0,
        };

        // thread from the top so the lowest index is handed out first
        for i in (0..capacity).rev() {
            arena.free(Obj::from_index(i));
        }

        if cfg!(feature = "memdbg") {
            log::debug!("created arena of {} cells", capacity);
        }

        arena
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Pops a cell off the free list and fills it
    ///
    /// Never collects; the evaluator collects at the top of each step.
    pub fn allocate(&mut self, cell: Cell) -> Result<Obj, LispErr> {
        let obj = self.free_list;
        let i = obj.index().ok_or(LispErr::OutOfMemory)?;

        self.free_list = match self.cells[i] {
            Cell::Free { next } => next,
            _ => Obj::NIL,
        };
        self.free_count -= 1;
        self.cells[i] = cell;

        Ok(obj)
    }

    /// Returns a cell to the pool; the caller guarantees it is unreachable
    pub fn free(&mut self, obj: Obj) {
        if let Some(i) = obj.index() {
            self.cells[i] = Cell::Free {
                next: self.free_list,
            };
            self.free_list = obj;
            self.free_count += 1;
        }
    }

    #[inline]
    pub fn get(&self, obj: Obj) -> Option<Cell> {
        obj.index().and_then(|i| self.cells.get(i)).copied()
    }

    #[inline]
    pub fn set(&mut self, obj: Obj, cell: Cell) {
        if let Some(slot) = obj.index().and_then(|i| self.cells.get_mut(i)) {
            *slot = cell;
        }
    }

    /// Raw view of the pool in index order
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Replaces the low cells with an image and frees everything above it
    ///
    /// The free list is rebuilt by the collection that must follow.
    pub(crate) fn restore(&mut self, image: &[Cell]) -> Result<(), LispErr> {
        if image.len() > self.capacity() {
            return Err(LispErr::OutOfMemory);
        }

        for (i, slot) in self.cells.iter_mut().enumerate() {
            *slot = image.get(i).copied().unwrap_or(Cell::Free { next: Obj::NIL });
        }
        self.marks.iter_mut().for_each(|m| *m = false);
        self.free_list = Obj::NIL;
        self.free_count = 0;

        Ok(())
    }

    /// Sets the mark on every cell reachable from obj
    ///
    /// Recurses into the head of each pair and iterates along the tail,
    /// so native depth follows car nesting rather than list length.
    pub fn mark(&mut self, mut obj: Obj) {
        loop {
            let i = match obj.index() {
                Some(i) => i,
                None => return,
            };
            if self.marks[i] {
                return;
            }
            self.marks[i] = true;

            match self.cells[i] {
                Cell::Pair { car, cdr } => {
                    self.mark(car);
                    obj = cdr;
                }
                Cell::Str { chars } => {
                    let mut chunk = chars;
                    while let Some(j) = chunk.index() {
                        self.marks[j] = true;
                        chunk = match self.cells[j] {
                            Cell::Chunk { next, .. } => next,
                            _ => Obj::NIL,
                        };
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    pub fn marked(&self, obj: Obj) -> bool {
        obj.index().map_or(false, |i| self.marks[i])
    }

    /// Frees every unmarked cell and clears every mark
    pub fn sweep(&mut self) -> usize {
        self.free_list = Obj::NIL;
        self.free_count = 0;

        for i in (0..self.capacity()).rev() {
            if self.marks[i] {
                self.marks[i] = false;
            } else {
                self.free(Obj::from_index(i));
            }
        }

        self.free_count
    }

    /// Full mark and sweep over a root set; returns the cells reclaimed
    pub fn collect(&mut self, roots: &[Obj]) -> usize {
        let start = self.free_count;

        for &root in roots {
            self.mark(root);
        }
        self.sweep();

        let reclaimed = self.free_count - start;
        if cfg!(feature = "memdbg") {
            log::debug!("collected {} cells, {} free", reclaimed, self.free_count);
        }

        reclaimed
    }

    /// Slides live cells to the low end of the pool
    ///
    /// Two fingers meet in the middle: the lowest free slot receives the
    /// highest live cell until none remain out of place. One fixup pass
    /// through the forwarding table then rewrites every link and root.
    /// Leaves the pool unmarked and returns the live cell count.
    pub fn compact(&mut self, roots: &mut [&mut Obj]) -> usize {
        for root in roots.iter() {
            self.mark(**root);
        }

        let capacity = self.capacity();
        let mut forward: Vec<u32> = (0..capacity as u32).collect();

        let mut lo = 0;
        while lo < capacity && self.marks[lo] {
            lo += 1;
        }

        let mut hi = capacity;
        while hi > 0 {
            hi -= 1;
            if hi <= lo {
                break;
            }

            if self.marks[hi] {
                self.cells[lo] = self.cells[hi];
                self.marks[lo] = true;
                self.marks[hi] = false;
                forward[hi] = lo as u32;

                while lo < capacity && self.marks[lo] {
                    lo += 1;
                }
            }
        }

        let relink = |obj: Obj| match obj.index() {
            Some(i) => Obj::from_index(forward[i] as usize),
            None => Obj::NIL,
        };

        for i in 0..lo {
            self.cells[i] = match self.cells[i] {
                Cell::Pair { car, cdr } => Cell::Pair {
                    car: relink(car),
                    cdr: relink(cdr),
                },
                Cell::Str { chars } => Cell::Str {
                    chars: relink(chars),
                },
                Cell::Chunk { next, packed } => Cell::Chunk {
                    next: relink(next),
                    packed,
                },
                other => other,
            };
        }

        for root in roots.iter_mut() {
            **root = relink(**root);
        }

        self.sweep();

        if cfg!(feature = "memdbg") {
            log::debug!("compacted to {} live cells", lo);
        }

        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Structural rendering that ignores cell positions
    fn shape(arena: &Arena, obj: Obj) -> String {
        match arena.get(obj) {
            None => "()".to_string(),
            Some(Cell::Pair { car, cdr }) => {
                format!("[{} {}]", shape(arena, car), shape(arena, cdr))
            }
            Some(Cell::Str { .. }) => format!("{:?}", arena.string_bytes(obj)),
            Some(cell) => format!("{:?}", cell),
        }
    }

    /// Builds the list (0 1 .. n-1) with a garbage cell after each element
    fn build_with_garbage(arena: &mut Arena, n: i32) -> Obj {
        let mut list = Obj::NIL;
        for i in (0..n).rev() {
            let num = arena.number(i).unwrap();
            arena.number(-1).unwrap();
            list = arena.cons(num, list).unwrap();
        }
        list
    }

    #[test]
    fn allocates_and_frees() {
        let mut arena = Arena::new(8);
        assert_eq!(arena.free_count(), 8);

        let a = arena.number(1).unwrap();
        assert_eq!(a.index(), Some(0));
        let b = arena.number(2).unwrap();
        assert_eq!(arena.free_count(), 6);

        arena.free(a);
        assert_eq!(arena.free_count(), 7);
        let c = arena.number(3).unwrap();
        assert_eq!(c, a);
        assert_eq!(arena.int(b), Some(2));
        assert_eq!(arena.free_count() + 2, arena.capacity());
    }

    #[test]
    fn runs_out() {
        let mut arena = Arena::new(3);
        for _ in 0..3 {
            arena.number(0).unwrap();
        }
        assert!(matches!(arena.number(0), Err(LispErr::OutOfMemory)));
    }

    #[test]
    fn collects() {
        let mut arena = Arena::new(100);

        let keep = build_with_garbage(&mut arena, 10);
        let s = arena.string_from_bytes(b"kept string").unwrap();
        let root = arena.cons(s, keep).unwrap();
        let before = shape(&arena, root);

        // 10 numbers, 10 conses, 1 root cons, string header and 3 chunks
        let reclaimed = arena.collect(&[root]);
        assert_eq!(reclaimed, 10);
        assert_eq!(arena.free_count(), 100 - 25);
        assert_eq!(shape(&arena, root), before);

        // a second pass finds nothing new
        assert_eq!(arena.collect(&[root]), 0);

        // dropping the root frees everything
        arena.collect(&[]);
        assert_eq!(arena.free_count(), 100);
    }

    #[test]
    fn marks_deep_tails() {
        let mut arena = Arena::new(40000);

        let mut list = Obj::NIL;
        for _ in 0..20000 {
            list = arena.cons(Obj::NIL, list).unwrap();
        }

        arena.collect(&[list]);
        assert_eq!(arena.free_count(), 20000);
    }

    #[test]
    fn compacts() {
        let mut arena = Arena::new(200);

        let mut env = build_with_garbage(&mut arena, 12);
        let s = arena.string_from_bytes(b"a string across chunks").unwrap();
        env = arena.cons(s, env).unwrap();
        for _ in 0..20 {
            arena.number(7).unwrap();
        }
        let inner = build_with_garbage(&mut arena, 3);
        let mut stack = arena.cons(inner, Obj::NIL).unwrap();
        let mut none = Obj::NIL;

        let env_shape = shape(&arena, env);
        let stack_shape = shape(&arena, stack);

        let live = arena.compact(&mut [&mut env, &mut stack, &mut none]);

        // 12 + 12 + 1 for env, 1 + 6 chunks for the string, 3 + 3 + 1 for stack
        assert_eq!(live, 39);
        assert_eq!(arena.free_count(), 200 - live);
        assert!(env.index().unwrap() < live);
        assert!(stack.index().unwrap() < live);
        assert!(none.is_nil());

        for cell in &arena.cells()[..live] {
            assert!(!matches!(cell, Cell::Free { .. }));
        }
        for cell in &arena.cells()[live..] {
            assert!(matches!(cell, Cell::Free { .. }));
        }

        assert_eq!(shape(&arena, env), env_shape);
        assert_eq!(shape(&arena, stack), stack_shape);

        // compaction leaves no marks behind
        assert!((0..200).all(|i| !arena.marked(Obj::from_index(i))));
    }

    #[test]
    fn restores() {
        let mut arena = Arena::new(10);
        let image = [
            Cell::Int(5),
            Cell::Pair {
                car: Obj::from_index(0),
                cdr: Obj::NIL,
            },
        ];

        arena.restore(&image).unwrap();
        arena.collect(&[Obj::from_index(1)]);
        assert_eq!(arena.free_count(), 8);
        assert_eq!(arena.int(arena.car(Obj::from_index(1))), Some(5));

        assert!(Arena::new(1).restore(&image).is_err());
    }
}
