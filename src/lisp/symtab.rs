// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/symtab.rs

// A table to associate symbol names with compact integer IDs. Names
// resolve through three tiers: the builtin table, a base 40 packing
// for short names, and a byte table of NUL-terminated long names.

// <>

use super::{
    core::{latin1, SymId},
    stdenv::{Builtin, BUILTINS},
    LispErr,
};

/// First identity of the long name tier
pub const LONG_BASE: SymId = 64000;

/// Headroom the long name table keeps free below its capacity
pub const BUFFERSIZE: usize = 34;

/// Long ids must fit sixteen bits alongside the other tiers
const MAX_LONG: usize = 1536;

// packed ids start at "a", which is 1 * 40 * 40
const PACKED_MIN: SymId = 1600;

fn radix40(c: u8) -> Option<SymId> {
    match c.to_ascii_lowercase() {
        0 => Some(0),
        c @ b'a'..=b'z' => Some((c - b'a') as SymId + 1),
        c @ b'0'..=b'9' => Some((c - b'0') as SymId + 30),
        _ => None,
    }
}

fn from_radix40(d: SymId) -> u8 {
    match d {
        1..=26 => b'a' + (d - 1) as u8,
        30..=39 => b'0' + (d - 30) as u8,
        _ => 0,
    }
}

/// Packs a name of up to three letters and digits into one integer
pub fn pack40(name: &[u8]) -> Option<SymId> {
    if name.is_empty() || name.len() > 3 {
        return None;
    }

    let mut id = 0;
    for i in 0..3 {
        let d = match name.get(i) {
            Some(&c) if c != 0 => radix40(c)?,
            Some(_) => return None,
            None => 0,
        };
        id = id * 40 + d;
    }

    Some(id)
}

pub fn unpack40(id: SymId) -> Vec<u8> {
    [id / 1600, id / 40 % 40, id % 40]
        .iter()
        .map(|&d| from_radix40(d))
        .filter(|&c| c != 0)
        .collect()
}

/// Row of the builtin table whose name matches, ignoring case
pub fn builtin(name: &[u8]) -> Option<SymId> {
    BUILTINS
        .iter()
        .position(|e| !e.name.is_empty() && e.name.as_bytes().eq_ignore_ascii_case(name))
        .map(|i| i as SymId)
}

/// Byte table of long symbol names
pub struct SymbolTable {
    table: Vec<u8>,
    top: usize,
}

impl SymbolTable {
    pub fn new(size: usize) -> Self {
        Self {
            table: vec![0; size],
            top: 0,
        }
    }

    /// Resolves a name to its identity, adding it to the long tier if new
    pub fn intern(&mut self, name: &[u8]) -> Result<SymId, LispErr> {
        if let Some(id) = builtin(name) {
            return Ok(id);
        }

        if let Some(id) = pack40(name) {
            return Ok(id);
        }

        if let Some(id) = self.find_long(name) {
            return Ok(id);
        }

        self.append(name)
    }

    fn entries(&self) -> impl Iterator<Item = &[u8]> {
        self.table[..self.top]
            .split(|&b| b == 0)
            .take_while(|e| !e.is_empty())
    }

    fn find_long(&self, name: &[u8]) -> Option<SymId> {
        self.entries()
            .position(|e| e.eq_ignore_ascii_case(name))
            .map(|n| LONG_BASE + n as SymId)
    }

    fn append(&mut self, name: &[u8]) -> Result<SymId, LispErr> {
        let newtop = self.top + name.len() + 1;
        if newtop + BUFFERSIZE > self.table.len() {
            return Err(LispErr::plain(None, "no room for long symbols"));
        }

        let ordinal = self.entries().count();
        if ordinal >= MAX_LONG {
            return Err(LispErr::plain(None, "Too many long symbols"));
        }

        self.table[self.top..newtop - 1].copy_from_slice(name);
        self.table[newtop - 1] = 0;
        self.top = newtop;

        Ok(LONG_BASE + ordinal as SymId)
    }

    /// Name bytes for an identity in any tier
    pub fn name(&self, id: SymId) -> Option<Vec<u8>> {
        if id < Builtin::EndFunctions.id() {
            BUILTINS.get(id as usize).map(|e| e.name.as_bytes().to_vec())
        } else if id >= LONG_BASE {
            self.entries()
                .nth((id - LONG_BASE) as usize)
                .map(|e| e.to_vec())
        } else if id >= PACKED_MIN {
            Some(unpack40(id))
        } else {
            None
        }
    }

    /// Printable name, for diagnostics
    pub fn name_string(&self, id: SymId) -> String {
        match self.name(id) {
            Some(bytes) => latin1(&bytes),
            None => format!("<symbol {}>", id),
        }
    }

    /// Removes a long name, shifting every later entry down
    ///
    /// Later entries change identity; only safe when no stored id
    /// names a symbol added after this one.
    pub fn delete(&mut self, id: SymId) -> bool {
        if id < LONG_BASE {
            return false;
        }

        let ordinal = (id - LONG_BASE) as usize;
        let mut start = 0;
        let mut span = None;
        for (n, entry) in self.entries().enumerate() {
            if n == ordinal {
                span = Some((start, entry.len() + 1));
                break;
            }
            start += entry.len() + 1;
        }

        let (start, len) = match span {
            Some(span) => span,
            None => return false,
        };

        self.table.copy_within(start + len..self.top, start);
        self.top -= len;
        self.table[self.top..].iter_mut().for_each(|b| *b = 0);
        true
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn size(&self) -> usize {
        self.table.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.table
    }

    /// Replaces the table contents from a persisted image
    pub fn restore(&mut self, top: usize, bytes: &[u8]) {
        let n = bytes.len().min(self.table.len());
        self.table[..n].copy_from_slice(&bytes[..n]);
        self.table[n..].iter_mut().for_each(|b| *b = 0);
        self.top = top.min(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs() {
        let alphabet = b"abcdefghijklmnopqrstuvwxyz0123456789";

        for &a in alphabet {
            assert_eq!(unpack40(pack40(&[a]).unwrap()), [a]);
            for &b in alphabet {
                assert_eq!(unpack40(pack40(&[a, b]).unwrap()), [a, b]);
                for &c in alphabet {
                    let id = pack40(&[a, b, c]).unwrap();
                    assert!(id >= PACKED_MIN && id < LONG_BASE);
                    assert_eq!(unpack40(id), [a, b, c]);
                }
            }
        }

        assert_eq!(pack40(b"a"), Some(1600));
        assert_eq!(pack40(b"FOO"), pack40(b"foo"));
        assert_eq!(pack40(b"a-b"), None);
        assert_eq!(pack40(b"abcd"), None);
        assert_eq!(pack40(b""), None);
    }

    #[test]
    fn tiers() {
        let mut tab = SymbolTable::new(1024);

        let car = tab.intern(b"CAR").unwrap();
        assert_eq!(car, Builtin::Car.id());
        assert_eq!(tab.name(car).unwrap(), b"car");

        let foo = tab.intern(b"foo").unwrap();
        assert_eq!(foo, tab.intern(b"foo").unwrap());
        assert!(foo >= PACKED_MIN && foo < LONG_BASE);
        assert_eq!(tab.top(), 0);

        let long = tab.intern(b"chickenfeed").unwrap();
        assert!(long >= LONG_BASE);
        assert_eq!(tab.intern(b"ChickenFeed").unwrap(), long);
        assert_eq!(tab.name(long).unwrap(), b"chickenfeed");
        assert_eq!(tab.top(), 12);

        let odd = tab.intern(b"*x*").unwrap();
        assert_eq!(odd, long + 1);
        assert_eq!(tab.name_string(odd), "*x*");

        // the empty marker rows never match
        assert_ne!(tab.intern(b"").ok(), Some(Builtin::SpecialForms.id()));
    }

    #[test]
    fn fills() {
        let mut tab = SymbolTable::new(BUFFERSIZE + 12);

        tab.intern(b"abcdefghij").unwrap();
        assert!(tab.intern(b"klmnopqrst").is_err());
        // a known name still resolves once the table is full
        assert!(tab.intern(b"abcdefghij").is_ok());
    }

    #[test]
    fn deletes() {
        let mut tab = SymbolTable::new(1024);

        let one = tab.intern(b"first-one").unwrap();
        let two = tab.intern(b"second-one").unwrap();
        let three = tab.intern(b"third-one").unwrap();

        assert!(tab.delete(two));
        assert_eq!(tab.name(one).unwrap(), b"first-one");
        // later entries slide into the freed identity
        assert_eq!(tab.name(two).unwrap(), b"third-one");
        assert_eq!(tab.name(three), None);
        assert_eq!(tab.top(), 20);
        assert!(!tab.delete(three));

        // the first and the only remaining entries
        assert!(tab.delete(one));
        assert_eq!(tab.name(one).unwrap(), b"third-one");
        assert_eq!(tab.top(), 10);
        assert!(tab.delete(one));
        assert_eq!(tab.top(), 0);
        assert!(tab.bytes().iter().all(|&b| b == 0));
        assert_eq!(tab.intern(b"fourth-one").unwrap(), one);
    }

    #[test]
    fn restores() {
        let mut tab = SymbolTable::new(64);
        let id = tab.intern(b"longname").unwrap();

        let (top, bytes) = (tab.top(), tab.bytes().to_vec());
        let mut other = SymbolTable::new(64);
        other.restore(top, &bytes);
        assert_eq!(other.name(id).unwrap(), b"longname");
        assert_eq!(other.intern(b"longname").unwrap(), id);
    }
}
