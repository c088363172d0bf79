// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/parser.rs

// The reader. Tokenizes a byte source one item at a time and builds
// cell graphs, interning symbol names as they appear.

// <>

use super::{
    core::{Obj, SymId},
    printer::CONTROL_CODES,
    stdenv::Builtin,
    stream::Ports,
    LispErr, Runtime,
};

/// Where the reader gets its bytes
pub enum Source {
    /// A registered port; pushback is kept by the port registry
    Port(u16),
    /// An in-memory buffer
    Text { bytes: Vec<u8>, pos: usize },
}

impl Source {
    pub fn text(bytes: &[u8]) -> Self {
        Source::Text {
            bytes: bytes.to_vec(),
            pos: 0,
        }
    }

    fn next(&mut self, ports: &mut Ports) -> Result<Option<u8>, LispErr> {
        match self {
            Source::Port(desc) => Ok(ports.get(*desc)?),
            Source::Text { bytes, pos } => {
                let b = bytes.get(*pos).copied();
                if b.is_some() {
                    *pos += 1;
                }
                Ok(b)
            }
        }
    }

    fn unget(&mut self, ports: &mut Ports, byte: u8) {
        match self {
            Source::Port(desc) => ports.unget(*desc, byte),
            Source::Text { pos, .. } => *pos -= 1,
        }
    }
}

enum Item {
    Bra,
    Ket,
    Quo,
    Dot,
    Atom(Obj),
}

fn digitvalue(d: u8) -> u32 {
    match d {
        b'0'..=b'9' => (d - b'0') as u32,
        _ => match d | 0x20 {
            c @ b'a'..=b'f' => (c - b'a') as u32 + 10,
            _ => 16,
        },
    }
}

fn delimiter(ch: Option<u8>) -> bool {
    match ch {
        None => true,
        Some(c) => c.is_ascii_whitespace() || c == b'(' || c == b')',
    }
}

impl Runtime {
    /// Reads one form; None at end of input
    pub fn read(&mut self, src: &mut Source) -> Result<Option<Obj>, LispErr> {
        match self.next_item(src)? {
            None => Ok(None),
            Some(Item::Ket) => Err(LispErr::plain(None, "unmatched right bracket")),
            Some(item) => self.read_from(src, item).map(Some),
        }
    }

    /// Reads the first form of a string; nil if there is none
    pub fn read_str(&mut self, text: &str) -> Result<Obj, LispErr> {
        let mut src = Source::text(text.as_bytes());
        Ok(self.read(&mut src)?.unwrap_or(Obj::NIL))
    }

    /// Reads a form that must be present, as after a quote or dot
    fn read_nested(&mut self, src: &mut Source) -> Result<Obj, LispErr> {
        match self.next_item(src)? {
            None | Some(Item::Ket) => Err(LispErr::plain(None, "incomplete list")),
            Some(item) => self.read_from(src, item),
        }
    }

    fn read_from(&mut self, src: &mut Source, item: Item) -> Result<Obj, LispErr> {
        match item {
            Item::Bra => self.read_rest(src),
            Item::Quo => self.read_quoted(src),
            Item::Dot => self.read_nested(src),
            Item::Atom(obj) => Ok(obj),
            Item::Ket => Err(LispErr::plain(None, "incomplete list")),
        }
    }

    fn read_quoted(&mut self, src: &mut Source) -> Result<Obj, LispErr> {
        let quoted = self.read_nested(src)?;
        self.reserve(3, &[quoted])?;
        let tail = self.arena.cons(quoted, Obj::NIL)?;
        let quote = self.arena.symbol(Builtin::Quote.id())?;
        self.arena.cons(quote, tail)
    }

    /// Reads list elements up to the closing bracket
    fn read_rest(&mut self, src: &mut Source) -> Result<Obj, LispErr> {
        // the partial list stays rooted while #. forms evaluate and
        // while the pool is collected to make room
        self.reserve(1, &[])?;
        self.push_gc(Obj::NIL)?;

        let mut head = Obj::NIL;
        let mut tail = Obj::NIL;

        loop {
            let item = match self.next_item(src)? {
                None => return Err(LispErr::plain(None, "incomplete list")),
                Some(Item::Ket) => break,
                Some(Item::Bra) => self.read_rest(src)?,
                Some(Item::Quo) => self.read_quoted(src)?,
                Some(Item::Dot) => {
                    if head.is_nil() {
                        return Err(LispErr::plain(None, "malformed list"));
                    }

                    let last = self.read_nested(src)?;
                    self.arena.set_cdr(tail, last);

                    match self.next_item(src)? {
                        Some(Item::Ket) => break,
                        None => return Err(LispErr::plain(None, "incomplete list")),
                        Some(_) => return Err(LispErr::plain(None, "malformed list")),
                    }
                }
                Some(Item::Atom(obj)) => obj,
            };

            self.reserve(1, &[item])?;
            let cell = self.arena.cons(item, Obj::NIL)?;
            if head.is_nil() {
                head = cell;
                self.arena.set_car(self.gc_stack, head);
            } else {
                self.arena.set_cdr(tail, cell);
            }
            tail = cell;
        }

        self.pop_gc();
        Ok(head)
    }

    /// Reads characters up to a delimiter into a new string
    ///
    /// A backslash takes the next character literally. Nil if the
    /// source is already exhausted.
    pub fn read_string(&mut self, src: &mut Source, delim: u8) -> Result<Obj, LispErr> {
        let mut ch = src.next(&mut self.ports)?;
        if ch.is_none() {
            return Ok(Obj::NIL);
        }

        let mut text = Vec::new();
        while let Some(c) = ch {
            if c == delim {
                break;
            }
            let c = if c == b'\\' {
                match src.next(&mut self.ports)? {
                    Some(e) => e,
                    None => break,
                }
            } else {
                c
            };
            text.push(c);
            ch = src.next(&mut self.ports)?;
        }

        self.reserve(1 + (text.len() + 3) / 4, &[])?;
        self.arena.string_from_bytes(&text)
    }

    fn next_item(&mut self, src: &mut Source) -> Result<Option<Item>, LispErr> {
        let mut ch = src.next(&mut self.ports)?;
        loop {
            match ch {
                Some(c) if c.is_ascii_whitespace() => ch = src.next(&mut self.ports)?,
                Some(b';') => {
                    while !matches!(ch, None | Some(b'\n')) {
                        ch = src.next(&mut self.ports)?;
                    }
                }
                _ => break,
            }
        }

        let c = match ch {
            None => return Ok(None),
            Some(c) => c,
        };

        match c {
            b')' => return Ok(Some(Item::Ket)),
            b'(' => return Ok(Some(Item::Bra)),
            b'\'' => return Ok(Some(Item::Quo)),
            b'"' => return self.read_string(src, b'"').map(|s| Some(Item::Atom(s))),
            _ => (),
        }

        let mut buffer = Vec::new();
        let mut base = 10;
        let mut sign = 1;
        let mut ch = Some(c);

        match c {
            b'+' => {
                buffer.push(c);
                ch = src.next(&mut self.ports)?;
            }
            b'-' => {
                sign = -1;
                buffer.push(c);
                ch = src.next(&mut self.ports)?;
            }
            b'.' => {
                buffer.push(c);
                ch = src.next(&mut self.ports)?;
                if matches!(ch, Some(w) if w.is_ascii_whitespace()) {
                    return Ok(Some(Item::Dot));
                }
            }
            b'#' => {
                ch = src.next(&mut self.ports)?;
                match ch {
                    Some(b'\\') => base = 0,
                    Some(b) if (b | 0x20) == b'b' => base = 2,
                    Some(b) if (b | 0x20) == b'o' => base = 8,
                    Some(b) if (b | 0x20) == b'x' => base = 16,
                    Some(b'\'') => return self.next_item(src),
                    Some(b'.') => {
                        let form = self.read_nested(src)?;
                        let saved = self.no_esc;
                        self.no_esc = true;
                        let result = self.eval(form, Obj::NIL);
                        self.no_esc = saved;
                        return Ok(Some(Item::Atom(result?)));
                    }
                    _ => return Err(LispErr::plain(None, "illegal character after #")),
                }
                ch = src.next(&mut self.ports)?;

                // a character literal always takes at least one byte
                if base == 0 {
                    if let Some(b) = ch {
                        buffer.push(b);
                        ch = src.next(&mut self.ports)?;
                    }
                }
            }
            _ => (),
        }

        // 0 undecided, -1 invalid, 1 valid
        let mut valid: i8 = match ch {
            Some(b'.') => 0,
            Some(b) if digitvalue(b) < base => 1,
            _ => -1,
        };

        let mut isfloat = c == b'.';
        let mut isexponent = false;
        let mut radix: u32 = 0;
        let mut wide: u64 = 0;

        while !delimiter(ch) {
            let b = ch.unwrap_or(b' ');
            buffer.push(b);

            if base == 10 && b == b'.' && !isexponent {
                isfloat = true;
            } else if base == 10 && (b == b'e' || b == b'E') {
                isfloat = true;
                isexponent = true;
                valid = if valid == 1 { 0 } else { -1 };
            } else if isexponent && (b == b'-' || b == b'+') {
            } else {
                let digit = digitvalue(b);
                valid = if digit < base && valid != -1 { 1 } else { -1 };
                if !isfloat && valid == 1 {
                    radix = radix.wrapping_mul(base).wrapping_add(digit);
                    wide = wide.saturating_mul(10).saturating_add(digit as u64);
                }
            }

            ch = src.next(&mut self.ports)?;
        }

        if let Some(b @ (b'(' | b')')) = ch {
            src.unget(&mut self.ports, b);
        }

        let text = std::str::from_utf8(&buffer).unwrap_or("");
        self.reserve(1, &[])?;

        if isfloat && valid == 1 {
            if let Ok(f) = text.parse::<f32>() {
                return Ok(Some(Item::Atom(self.arena.makefloat(f)?)));
            }
        } else if valid == 1 {
            let atom = if base != 10 {
                self.arena.number((radix as i32).wrapping_mul(sign))?
            } else if wide > i32::MAX as u64 + (sign < 0) as u64 {
                self.arena.makefloat(wide as f32 * sign as f32)?
            } else {
                self.arena.number((wide as i64 * sign as i64) as i32)?
            };
            return Ok(Some(Item::Atom(atom)));
        } else if base == 0 {
            if buffer.len() == 1 {
                return Ok(Some(Item::Atom(self.arena.character(buffer[0])?)));
            }
            return match CONTROL_CODES
                .iter()
                .position(|name| name.as_bytes().eq_ignore_ascii_case(&buffer))
            {
                Some(code) => Ok(Some(Item::Atom(self.arena.character(code as u8)?))),
                None => Err(LispErr::plain(None, "Unknown character")),
            };
        }

        if buffer.is_empty() {
            return Err(LispErr::plain(None, "illegal character after #"));
        }

        let id: SymId = self.symtab.intern(&buffer)?;
        if id == Builtin::Nil.id() {
            Ok(Some(Item::Atom(Obj::NIL)))
        } else {
            Ok(Some(Item::Atom(self.arena.symbol(id)?)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{stream::BufferPort, Config};
    use super::*;

    fn bare() -> Runtime {
        Runtime::with_console(
            Config {
                load_library: false,
                ..Config::default()
            },
            Box::new(BufferPort::new(b"").0),
        )
        .unwrap()
    }

    fn reprint(rt: &mut Runtime, text: &str) -> String {
        let obj = rt.read_str(text).unwrap();
        rt.printed(obj).to_string()
    }

    fn read_err(rt: &mut Runtime, text: &str) -> String {
        match rt.read_str(text) {
            Err(e) => e.to_string(),
            Ok(obj) => panic!("read {} without error", rt.printed(obj)),
        }
    }

    #[test]
    fn lists() {
        let mut rt = bare();

        assert_eq!(reprint(&mut rt, "(1 2 . 3)"), "(1 2 . 3)");
        assert_eq!(reprint(&mut rt, "(a (b (c)) ())"), "(a (b (c)) nil)");
        assert_eq!(reprint(&mut rt, "'x"), "(quote x)");
        assert_eq!(reprint(&mut rt, "('a . 'b)"), "((quote a) quote b)");
        assert_eq!(reprint(&mut rt, "(1 ; note\n 2)"), "(1 2)");
        assert_eq!(reprint(&mut rt, "(list #'car)"), "(list car)");
        assert_eq!(reprint(&mut rt, "   "), "nil");
        assert_eq!(reprint(&mut rt, "NIL"), "nil");
    }

    #[test]
    fn numbers() {
        let mut rt = bare();

        assert_eq!(reprint(&mut rt, "42"), "42");
        assert_eq!(reprint(&mut rt, "-17"), "-17");
        assert_eq!(reprint(&mut rt, "+5"), "5");
        assert_eq!(reprint(&mut rt, "2.5"), "2.5");
        assert_eq!(reprint(&mut rt, "-.5"), "-0.5");
        assert_eq!(reprint(&mut rt, "1e3"), "1000.0");
        assert_eq!(reprint(&mut rt, "2.5e-3"), "0.0025");
        assert_eq!(reprint(&mut rt, "#b1010"), "10");
        assert_eq!(reprint(&mut rt, "#o17"), "15");
        assert_eq!(reprint(&mut rt, "#xFF"), "255");
        assert_eq!(reprint(&mut rt, "2147483647"), "2147483647");
        assert_eq!(reprint(&mut rt, "-2147483648"), "-2147483648");
        assert_eq!(reprint(&mut rt, "2147483648"), "2.14748e9");

        let big = rt.read_str("2147483648").unwrap();
        assert!(rt.arena.floatp(big));
    }

    #[test]
    fn symbols() {
        let mut rt = bare();

        let a = rt.read_str("foo").unwrap();
        let b = rt.read_str("FOO").unwrap();
        assert!(rt.arena.eq(a, b));
        assert_eq!(reprint(&mut rt, "Car"), "car");
        assert_eq!(reprint(&mut rt, "1+"), "1+");
        assert_eq!(reprint(&mut rt, "-"), "-");
        assert_eq!(reprint(&mut rt, "long-name"), "long-name");
        assert_eq!(reprint(&mut rt, "1e"), "1e");
    }

    #[test]
    fn characters_and_strings() {
        let mut rt = bare();

        assert_eq!(reprint(&mut rt, "#\\a"), "#\\a");
        assert_eq!(reprint(&mut rt, "#\\space"), "#\\Space");
        assert_eq!(reprint(&mut rt, "#\\Newline"), "#\\Newline");
        assert_eq!(reprint(&mut rt, "(#\\( #\\))"), "(#\\( #\\))");
        assert_eq!(reprint(&mut rt, "\"a \\\"b\\\" c\""), "\"a \\\"b\\\" c\"");
        assert_eq!(read_err(&mut rt, "#\\bogus"), "Unknown character");
    }

    #[test]
    fn read_time_eval() {
        let mut rt = bare();
        assert_eq!(reprint(&mut rt, "(a #.(+ 1 2))"), "(a 3)");
    }

    #[test]
    fn malformed() {
        let mut rt = bare();

        assert_eq!(read_err(&mut rt, ")"), "unmatched right bracket");
        assert_eq!(read_err(&mut rt, "(1 2"), "incomplete list");
        assert_eq!(read_err(&mut rt, "(1 . 2 3)"), "malformed list");
        assert_eq!(read_err(&mut rt, "(1 . 2 . 3)"), "malformed list");
        assert_eq!(read_err(&mut rt, "( . 2)"), "malformed list");
        assert_eq!(read_err(&mut rt, "'"), "incomplete list");
        assert_eq!(read_err(&mut rt, "#q"), "illegal character after #");
    }

    #[test]
    fn sequential() {
        let mut rt = bare();
        let mut src = Source::text(b"(a)(b) c");

        let first = rt.read(&mut src).unwrap().unwrap();
        let second = rt.read(&mut src).unwrap().unwrap();
        let third = rt.read(&mut src).unwrap().unwrap();
        assert_eq!(rt.printed(first).to_string(), "(a)");
        assert_eq!(rt.printed(second).to_string(), "(b)");
        assert_eq!(rt.printed(third).to_string(), "c");
        assert!(rt.read(&mut src).unwrap().is_none());
    }
}
