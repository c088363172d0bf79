// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/core.rs

// Core value representation: cell handles, the tagged cell variant,
// typed constructors and predicates, and the packed string chunks.

// <>

use super::{memmgt::Arena, LispErr};

/// Integer identity of a symbol; see the symbol table for the tiers
pub type SymId = u32;

/// Handle to a cell in the arena
///
/// Zero is nil; any other value is a cell index plus one, so nil can
/// never name an allocated cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Obj(u32);

impl Obj {
    pub const NIL: Obj = Obj(0);

    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub(crate) fn from_index(index: usize) -> Obj {
        Obj(index as u32 + 1)
    }

    /// Arena slot of a non-nil handle
    #[inline(always)]
    pub(crate) fn index(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0 as usize - 1)
        }
    }
}

macro_rules! enum_and_tryfrom {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl std::convert::TryFrom<u8> for $name {
            type Error = ();

            #[inline(always)]
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $(x if x == $name::$vname as u8 => Ok($name::$vname),)*
                    _ => Err(()),
                }
            }
        }
    }
}

pub(crate) use enum_and_tryfrom;

enum_and_tryfrom! {
    /// Type tags in persisted order; the two link-bearing kinds sort last
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    #[repr(u8)]
    pub enum Tag {
        Zero = 0,
        Symbol = 2,
        Number = 4,
        Stream = 6,
        Character = 8,
        Float = 10,
        String = 12,
        Pair = 14,
    }
}

/// One fixed-width arena slot
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cell {
    /// Member of the free list
    Free { next: Obj },
    Pair { car: Obj, cdr: Obj },
    Symbol(SymId),
    Int(i32),
    Float(f32),
    Char(u8),
    /// Transport kind in the high byte, address in the low byte
    Stream(u16),
    /// String header; the characters live in a chain of chunks
    Str { chars: Obj },
    /// Up to four characters, first character in the high byte
    Chunk { next: Obj, packed: u32 },
}

impl Cell {
    pub fn tag(&self) -> Tag {
        match self {
            Cell::Free { .. } => Tag::Zero,
            Cell::Pair { .. } | Cell::Chunk { .. } => Tag::Pair,
            Cell::Symbol(_) => Tag::Symbol,
            Cell::Int(_) => Tag::Number,
            Cell::Float(_) => Tag::Float,
            Cell::Char(_) => Tag::Character,
            Cell::Stream(_) => Tag::Stream,
            Cell::Str { .. } => Tag::String,
        }
    }
}

/// Characters stored per string chunk
pub const CHUNK_CHARS: usize = 4;

/// Bytes are Latin-1 characters throughout the runtime
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

// constructors

impl Arena {
    pub fn number(&mut self, n: i32) -> Result<Obj, LispErr> {
        self.allocate(Cell::Int(n))
    }

    pub fn makefloat(&mut self, f: f32) -> Result<Obj, LispErr> {
        self.allocate(Cell::Float(f))
    }

    pub fn character(&mut self, c: u8) -> Result<Obj, LispErr> {
        self.allocate(Cell::Char(c))
    }

    pub fn cons(&mut self, car: Obj, cdr: Obj) -> Result<Obj, LispErr> {
        self.allocate(Cell::Pair { car, cdr })
    }

    pub fn symbol(&mut self, id: SymId) -> Result<Obj, LispErr> {
        self.allocate(Cell::Symbol(id))
    }

    pub fn stream(&mut self, descriptor: u16) -> Result<Obj, LispErr> {
        self.allocate(Cell::Stream(descriptor))
    }

    /// Builds a string, packing the bytes into chunks; NUL bytes are dropped
    pub fn string_from_bytes(&mut self, bytes: &[u8]) -> Result<Obj, LispErr> {
        let string = self.allocate(Cell::Str { chars: Obj::NIL })?;

        let text: Vec<u8> = bytes.iter().copied().filter(|&b| b != 0).collect();

        let mut tail = Obj::NIL;
        for quad in text.chunks(CHUNK_CHARS) {
            let packed = quad
                .iter()
                .enumerate()
                .fold(0u32, |acc, (i, &b)| acc | (b as u32) << (24 - 8 * i));

            let chunk = self.allocate(Cell::Chunk {
                next: Obj::NIL,
                packed,
            })?;

            if tail.is_nil() {
                self.set(string, Cell::Str { chars: chunk });
            } else if let Some(Cell::Chunk { packed, .. }) = self.get(tail) {
                self.set(tail, Cell::Chunk { next: chunk, packed });
            }
            tail = chunk;
        }

        Ok(string)
    }
}

// predicates

impl Arena {
    pub fn consp(&self, x: Obj) -> bool {
        matches!(self.get(x), Some(Cell::Pair { .. }))
    }

    pub fn atom(&self, x: Obj) -> bool {
        !self.consp(x)
    }

    pub fn listp(&self, x: Obj) -> bool {
        x.is_nil() || self.consp(x)
    }

    pub fn improperp(&self, x: Obj) -> bool {
        !self.listp(x)
    }

    pub fn integerp(&self, x: Obj) -> bool {
        matches!(self.get(x), Some(Cell::Int(_)))
    }

    pub fn floatp(&self, x: Obj) -> bool {
        matches!(self.get(x), Some(Cell::Float(_)))
    }

    pub fn symbolp(&self, x: Obj) -> bool {
        matches!(self.get(x), Some(Cell::Symbol(_)))
    }

    pub fn stringp(&self, x: Obj) -> bool {
        matches!(self.get(x), Some(Cell::Str { .. }))
    }

    pub fn characterp(&self, x: Obj) -> bool {
        matches!(self.get(x), Some(Cell::Char(_)))
    }

    pub fn streamp(&self, x: Obj) -> bool {
        matches!(self.get(x), Some(Cell::Stream(_)))
    }

    /// True if x is a symbol cell naming id
    pub fn is_sym(&self, x: Obj, id: SymId) -> bool {
        self.sym(x) == Some(id)
    }

    /// Symbols and scalars compare by payload, everything else by identity
    pub fn eq(&self, a: Obj, b: Obj) -> bool {
        if a == b {
            return true;
        }

        match (self.get(a), self.get(b)) {
            (Some(Cell::Symbol(x)), Some(Cell::Symbol(y))) => x == y,
            (Some(Cell::Int(x)), Some(Cell::Int(y))) => x == y,
            (Some(Cell::Float(x)), Some(Cell::Float(y))) => x.to_bits() == y.to_bits(),
            (Some(Cell::Char(x)), Some(Cell::Char(y))) => x == y,
            _ => false,
        }
    }
}

// accessors

impl Arena {
    /// Head of a pair, or nil for anything else
    #[inline]
    pub fn car(&self, x: Obj) -> Obj {
        match self.get(x) {
            Some(Cell::Pair { car, .. }) => car,
            _ => Obj::NIL,
        }
    }

    /// Tail of a pair, or nil for anything else
    #[inline]
    pub fn cdr(&self, x: Obj) -> Obj {
        match self.get(x) {
            Some(Cell::Pair { cdr, .. }) => cdr,
            _ => Obj::NIL,
        }
    }

    #[inline]
    pub fn second(&self, x: Obj) -> Obj {
        self.car(self.cdr(x))
    }

    #[inline]
    pub fn third(&self, x: Obj) -> Obj {
        self.car(self.cdr(self.cdr(x)))
    }

    pub fn set_car(&mut self, x: Obj, val: Obj) {
        if let Some(Cell::Pair { cdr, .. }) = self.get(x) {
            self.set(x, Cell::Pair { car: val, cdr });
        }
    }

    pub fn set_cdr(&mut self, x: Obj, val: Obj) {
        if let Some(Cell::Pair { car, .. }) = self.get(x) {
            self.set(x, Cell::Pair { car, cdr: val });
        }
    }

    pub fn sym(&self, x: Obj) -> Option<SymId> {
        match self.get(x) {
            Some(Cell::Symbol(id)) => Some(id),
            _ => None,
        }
    }

    pub fn int(&self, x: Obj) -> Option<i32> {
        match self.get(x) {
            Some(Cell::Int(n)) => Some(n),
            _ => None,
        }
    }

    pub fn float(&self, x: Obj) -> Option<f32> {
        match self.get(x) {
            Some(Cell::Float(f)) => Some(f),
            _ => None,
        }
    }

    /// Integer or float value, widened to a float
    pub fn intfloat(&self, x: Obj) -> Option<f32> {
        match self.get(x) {
            Some(Cell::Int(n)) => Some(n as f32),
            Some(Cell::Float(f)) => Some(f),
            _ => None,
        }
    }

    pub fn chr(&self, x: Obj) -> Option<u8> {
        match self.get(x) {
            Some(Cell::Char(c)) => Some(c),
            _ => None,
        }
    }

    pub fn stream_desc(&self, x: Obj) -> Option<u16> {
        match self.get(x) {
            Some(Cell::Stream(d)) => Some(d),
            _ => None,
        }
    }
}

// strings

impl Arena {
    /// Walks a string's chunk chain, yielding each packed word
    pub fn chunks(&self, string: Obj) -> Chunks<'_> {
        let first = match self.get(string) {
            Some(Cell::Str { chars }) => chars,
            _ => Obj::NIL,
        };

        Chunks {
            arena: self,
            next: first,
        }
    }

    pub fn string_bytes(&self, string: Obj) -> Vec<u8> {
        let mut out = Vec::new();
        for packed in self.chunks(string) {
            out.extend(packed.to_be_bytes().iter().filter(|&&b| b != 0));
        }
        out
    }

    pub fn string_len(&self, string: Obj) -> usize {
        self.chunks(string)
            .map(|packed| packed.to_be_bytes().iter().filter(|&&b| b != 0).count())
            .sum()
    }

    /// Character at position n, or 0 past the end
    pub fn nth_char(&self, string: Obj, n: usize) -> u8 {
        match self.chunks(string).nth(n / CHUNK_CHARS) {
            Some(packed) => packed.to_be_bytes()[n % CHUNK_CHARS],
            None => 0,
        }
    }
}

pub struct Chunks<'a> {
    arena: &'a Arena,
    next: Obj,
}

impl Iterator for Chunks<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match self.arena.get(self.next) {
            Some(Cell::Chunk { next, packed }) => {
                self.next = next;
                Some(packed)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles() {
        assert!(Obj::NIL.is_nil());
        assert_eq!(Obj::NIL.index(), None);
        assert_eq!(Obj::from_index(7).index(), Some(7));
        assert!(!Obj::from_index(0).is_nil());
    }

    #[test]
    fn tags() {
        assert_eq!(Tag::try_from(12), Ok(Tag::String));
        assert!(Tag::try_from(3).is_err());
        assert!(Tag::String < Tag::Pair);
        assert_eq!(Cell::Int(1).tag(), Tag::Number);
    }

    #[test]
    fn strings() {
        let mut arena = Arena::new(64);

        let s = arena.string_from_bytes(b"hello, world").unwrap();
        assert!(arena.stringp(s));
        assert_eq!(arena.string_len(s), 12);
        assert_eq!(arena.string_bytes(s), b"hello, world");
        assert_eq!(arena.nth_char(s, 0), b'h');
        assert_eq!(arena.nth_char(s, 5), b',');
        assert_eq!(arena.nth_char(s, 11), b'd');
        assert_eq!(arena.nth_char(s, 12), 0);
        assert_eq!(arena.chunks(s).count(), 3);

        let e = arena.string_from_bytes(b"").unwrap();
        assert_eq!(arena.string_len(e), 0);
        assert_eq!(arena.chunks(e).count(), 0);
    }

    #[test]
    fn equality() {
        let mut arena = Arena::new(16);

        let a = arena.number(42).unwrap();
        let b = arena.number(42).unwrap();
        let c = arena.makefloat(42.0).unwrap();
        let s = arena.symbol(1600).unwrap();
        let t = arena.symbol(1600).unwrap();
        let p = arena.cons(a, Obj::NIL).unwrap();
        let q = arena.cons(a, Obj::NIL).unwrap();

        assert!(arena.eq(a, b));
        assert!(!arena.eq(a, c));
        assert!(arena.eq(s, t));
        assert!(arena.eq(p, p));
        assert!(!arena.eq(p, q));
        assert!(arena.eq(Obj::NIL, Obj::NIL));
        assert!(!arena.eq(Obj::NIL, a));
    }

    #[test]
    fn accessors() {
        let mut arena = Arena::new(16);

        let one = arena.number(1).unwrap();
        let two = arena.number(2).unwrap();
        let p = arena.cons(one, two).unwrap();

        assert_eq!(arena.car(p), one);
        assert_eq!(arena.cdr(p), two);
        assert!(arena.improperp(arena.cdr(p)));
        assert_eq!(arena.car(one), Obj::NIL);

        arena.set_cdr(p, Obj::NIL);
        assert!(arena.listp(arena.cdr(p)));
        assert_eq!(arena.intfloat(two), Some(2.0));
    }
}
