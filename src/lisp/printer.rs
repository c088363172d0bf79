// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/printer.rs

// Renders cell graphs as text, readably or not, plus the measuring
// pretty printer used by pprint.

// <>

use super::{
    core::{latin1, Cell, Obj},
    stdenv::Builtin,
    stream, Runtime,
};

use std::fmt;

const PPINDENT: i32 = 2;
const PPWIDTH: i32 = 80;

/// Names for the characters that print as #\Name
pub const CONTROL_CODES: [&str; 33] = [
    "Null",
    "SOH",
    "STX",
    "ETX",
    "EOT",
    "ENQ",
    "ACK",
    "Bell",
    "Backspace",
    "Tab",
    "Newline",
    "VT",
    "Page",
    "Return",
    "SO",
    "SI",
    "DLE",
    "DC1",
    "DC2",
    "DC3",
    "DC4",
    "NAK",
    "SYN",
    "ETB",
    "CAN",
    "EM",
    "SUB",
    "Escape",
    "FS",
    "GS",
    "RS",
    "US",
    "Space",
];

/// Forms whose first argument stays on the opening line
const PP_SPECIALS: [Builtin; 16] = [
    Builtin::Dotimes,
    Builtin::Dolist,
    Builtin::If,
    Builtin::Setq,
    Builtin::Tee,
    Builtin::Let,
    Builtin::LetStar,
    Builtin::Lambda,
    Builtin::When,
    Builtin::Unless,
    Builtin::WithI2c,
    Builtin::WithSerial,
    Builtin::WithSpi,
    Builtin::WithSdCard,
    Builtin::WithSpiffs,
    Builtin::ForMillis,
];

pub fn pint(out: &mut Vec<u8>, i: i32) {
    out.extend_from_slice(i.to_string().as_bytes());
}

/// Six significant digits, trailing zeros dropped
fn pmantissa(out: &mut Vec<u8>, f: f64) {
    let mut sig = f.log10().floor() as i32;
    let mut mul = 10f64.powi(5 - sig) as i32;
    let mut i = (f * mul as f64).round() as i32;
    let mut point = false;

    if i == 1_000_000 {
        i = 100_000;
        sig += 1;
    }

    if sig < 0 {
        out.extend_from_slice(b"0.");
        point = true;
        for _ in 0..(-sig - 1) {
            out.push(b'0');
        }
    }

    mul = 100_000;
    for j in 0..7 {
        let d = i / mul;
        out.push(d as u8 + b'0');
        i -= d * mul;

        if i == 0 {
            if !point {
                for _ in j..sig {
                    out.push(b'0');
                }
                out.extend_from_slice(b".0");
            }
            return;
        }

        if j == sig && sig >= 0 {
            out.push(b'.');
            point = true;
        }
        mul /= 10;
    }
}

pub fn pfloat(out: &mut Vec<u8>, mut f: f32) {
    if f.is_nan() {
        out.extend_from_slice(b"NaN");
        return;
    }
    if f == 0.0 {
        out.push(b'0');
        return;
    }
    if f.is_infinite() {
        out.extend_from_slice(b"Inf");
        return;
    }

    if f < 0.0 {
        out.push(b'-');
        f = -f;
    }

    let mut m = f as f64;
    let mut e = 0;
    if !(1e-3..1e5).contains(&f) {
        e = m.log10().floor() as i32;
        m /= 10f64.powi(e);
        if m < 1.0 {
            m *= 10.0;
            e -= 1;
        }
        // the mantissa must stay below 10 after rounding to six digits
        if (m * 1e5).round() >= 1e6 {
            m /= 10.0;
            e += 1;
        }
    }

    pmantissa(out, m);

    if e != 0 {
        out.push(b'e');
        pint(out, e);
    }
}

pub fn pcharacter(out: &mut Vec<u8>, c: u8, readably: bool) {
    if !readably {
        out.push(c);
    } else {
        out.extend_from_slice(b"#\\");
        match CONTROL_CODES.get(c as usize) {
            Some(name) if c <= 32 => out.extend_from_slice(name.as_bytes()),
            _ => out.push(c),
        }
    }
}

impl Runtime {
    /// Appends the printed form of an object to a buffer
    pub fn print_object(&self, out: &mut Vec<u8>, form: Obj, readably: bool) {
        let cell = match self.arena.get(form) {
            None => {
                out.extend_from_slice(b"nil");
                return;
            }
            Some(cell) => cell,
        };

        match cell {
            Cell::Pair { car, .. } if self.arena.is_sym(car, Builtin::Closure.id()) => {
                out.extend_from_slice(b"<closure>");
            }
            Cell::Pair { car, cdr } => {
                out.push(b'(');
                self.print_object(out, car, readably);

                let mut form = cdr;
                while self.arena.consp(form) {
                    out.push(b' ');
                    self.print_object(out, self.arena.car(form), readably);
                    form = self.arena.cdr(form);
                }

                if !form.is_nil() {
                    out.extend_from_slice(b" . ");
                    self.print_object(out, form, readably);
                }
                out.push(b')');
            }
            Cell::Int(i) => pint(out, i),
            Cell::Float(f) => pfloat(out, f),
            Cell::Symbol(id) => {
                if id != Builtin::Nothing.id() {
                    match self.symtab.name(id) {
                        Some(name) => out.extend_from_slice(&name),
                        None => out.extend_from_slice(self.symtab.name_string(id).as_bytes()),
                    }
                }
            }
            Cell::Char(c) => pcharacter(out, c, readably),
            Cell::Str { .. } => {
                if readably {
                    out.push(b'"');
                }
                for ch in self.arena.string_bytes(form) {
                    if readably && (ch == b'"' || ch == b'\\') {
                        out.push(b'\\');
                    }
                    out.push(ch);
                }
                if readably {
                    out.push(b'"');
                }
            }
            Cell::Stream(desc) => {
                let kind = stream::split(desc).map_or("serial", |(k, _)| k.name());
                out.push(b'<');
                out.extend_from_slice(kind.as_bytes());
                out.extend_from_slice(b"-stream ");
                pint(out, (desc & 0xff) as i32);
                out.push(b'>');
            }
            Cell::Chunk { .. } | Cell::Free { .. } => out.extend_from_slice(b"<invalid>"),
        }
    }

    pub fn render(&self, form: Obj, readably: bool) -> Vec<u8> {
        let mut out = Vec::new();
        self.print_object(&mut out, form, readably);
        out
    }

    /// Displayable wrapper that prints an object readably
    pub fn printed(&self, obj: Obj) -> Printed<'_> {
        Printed {
            rt: self,
            obj,
            readably: true,
        }
    }

    /// Printed width of an atom; newlines count double
    fn atomwidth(&self, obj: Obj) -> i32 {
        self.render(obj, true)
            .iter()
            .map(|&c| if c == b'\n' { 2 } else { 1 })
            .sum()
    }

    fn quoted(&self, obj: Obj) -> bool {
        let a = &self.arena;
        a.consp(obj)
            && a.is_sym(a.car(obj), Builtin::Quote.id())
            && a.consp(a.cdr(obj))
            && a.cdr(a.cdr(obj)).is_nil()
    }

    fn subwidth(&self, obj: Obj, w: i32) -> i32 {
        if self.arena.atom(obj) {
            w - self.atomwidth(obj)
        } else if self.quoted(obj) {
            self.subwidthlist(self.arena.car(self.arena.cdr(obj)), w - 1)
        } else {
            self.subwidthlist(obj, w - 1)
        }
    }

    fn subwidthlist(&self, mut form: Obj, mut w: i32) -> i32 {
        while !form.is_nil() && w >= 0 {
            if self.arena.atom(form) {
                return w - (2 + self.atomwidth(form));
            }
            w = self.subwidth(self.arena.car(form), w - 1);
            form = self.arena.cdr(form);
        }
        w
    }

    /// Prints a form, breaking lists that overflow the line width
    pub fn superprint(&self, out: &mut Vec<u8>, form: Obj, lm: i32) {
        if self.arena.atom(form) {
            if self.arena.is_sym(form, Builtin::Nothing.id()) {
                out.extend_from_slice(b"nothing");
            } else {
                self.print_object(out, form, true);
            }
        } else if self.quoted(form) {
            out.push(b'\'');
            self.superprint(out, self.arena.car(self.arena.cdr(form)), lm + 1);
        } else {
            let fits = self.subwidth(form, PPWIDTH - lm) >= 0;
            self.supersub(out, form, lm + PPINDENT, !fits);
        }
    }

    fn supersub(&self, out: &mut Vec<u8>, mut form: Obj, lm: i32, split: bool) {
        let mut special = 0;
        let mut separate = true;

        if let Some(name) = self.arena.sym(self.arena.car(form)) {
            if name == Builtin::Defun.id() {
                special = 2;
            } else if PP_SPECIALS.iter().any(|b| b.id() == name) {
                special = 1;
            }
        }

        while !form.is_nil() {
            if self.arena.atom(form) {
                out.extend_from_slice(b" . ");
                self.print_object(out, form, true);
                out.push(b')');
                return;
            } else if separate {
                out.push(b'(');
                separate = false;
            } else if special > 0 {
                out.push(b' ');
                special -= 1;
            } else if !split {
                out.push(b' ');
            } else {
                out.push(b'\n');
                out.extend(std::iter::repeat(b' ').take(lm.max(0) as usize));
            }

            self.superprint(out, self.arena.car(form), lm);
            form = self.arena.cdr(form);
        }

        out.push(b')');
    }
}

pub struct Printed<'a> {
    rt: &'a Runtime,
    obj: Obj,
    readably: bool,
}

impl Printed<'_> {
    pub fn unreadably(self) -> Self {
        Self {
            readably: false,
            ..self
        }
    }
}

impl fmt::Display for Printed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", latin1(&self.rt.render(self.obj, self.readably)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Config, Runtime};
    use super::*;

    fn float_text(f: f32) -> String {
        let mut out = Vec::new();
        pfloat(&mut out, f);
        String::from_utf8(out).unwrap()
    }

    fn bare() -> Runtime {
        Runtime::with_console(
            Config {
                load_library: false,
                ..Config::default()
            },
            Box::new(stream::BufferPort::new(b"").0),
        )
        .unwrap()
    }

    #[test]
    fn floats() {
        assert_eq!(float_text(3.5), "3.5");
        assert_eq!(float_text(1.0), "1.0");
        assert_eq!(float_text(100.0), "100.0");
        assert_eq!(float_text(-0.25), "-0.25");
        assert_eq!(float_text(0.0), "0");
        assert_eq!(float_text(0.001), "0.001");
        assert_eq!(float_text(1.5e5), "1.5e5");
        assert_eq!(float_text(99999.0), "99999.0");
        assert_eq!(float_text(1.5e-7), "1.5e-7");
        assert_eq!(float_text(3.1415927), "3.14159");
        assert_eq!(float_text(f32::INFINITY), "Inf");
        assert_eq!(float_text(f32::NAN), "NaN");
    }

    #[test]
    fn extreme_floats() {
        assert_eq!(float_text(1e-30), "1.0e-30");
        assert_eq!(float_text(1e30), "1.0e30");
        assert_eq!(float_text(1e-38), "1.0e-38");
        assert_eq!(float_text(1e-39), "1.0e-39");
        assert_eq!(float_text(-2.5e-42), "-2.49992e-42");
        assert_eq!(float_text(f32::from_bits(1)), "1.4013e-45");
        assert_eq!(float_text(f32::MAX), "3.40282e38");
        assert_eq!(float_text(9.9999999e-5), "1.0e-4");
        assert_eq!(float_text(0.000999), "9.99e-4");
    }

    #[test]
    fn characters() {
        let mut out = Vec::new();
        pcharacter(&mut out, b'a', true);
        pcharacter(&mut out, b' ', true);
        pcharacter(&mut out, b'\n', true);
        pcharacter(&mut out, b'a', false);
        assert_eq!(out, b"#\\a#\\Space#\\Newlinea");
    }

    #[test]
    fn objects() {
        let mut rt = bare();

        let one = rt.arena.number(1).unwrap();
        let two = rt.arena.number(2).unwrap();
        let three = rt.arena.number(3).unwrap();
        let tail = rt.arena.cons(two, three).unwrap();
        let list = rt.arena.cons(one, tail).unwrap();
        assert_eq!(rt.printed(list).to_string(), "(1 2 . 3)");

        let s = rt.arena.string_from_bytes(b"say \"hi\"").unwrap();
        assert_eq!(rt.printed(s).to_string(), "\"say \\\"hi\\\"\"");
        assert_eq!(rt.printed(s).unreadably().to_string(), "say \"hi\"");

        let nothing = rt.arena.symbol(Builtin::Nothing.id()).unwrap();
        assert_eq!(rt.printed(nothing).to_string(), "");

        let closure = rt.arena.symbol(Builtin::Closure.id()).unwrap();
        let c = rt.arena.cons(closure, list).unwrap();
        assert_eq!(rt.printed(c).to_string(), "<closure>");

        let sd = rt.arena.stream(stream::descriptor(stream::Kind::Sd, 1)).unwrap();
        assert_eq!(rt.printed(sd).to_string(), "<sd-stream 1>");

        assert_eq!(rt.printed(Obj::NIL).to_string(), "nil");
    }

    #[test]
    fn pretty() {
        let mut rt = bare();

        let short = rt.read_str("(defun sq (x) (* x x))").unwrap();
        let mut out = Vec::new();
        rt.superprint(&mut out, short, 0);
        assert_eq!(out, b"(defun sq (x) (* x x))");

        let long = rt
            .read_str(
                "(defun long-function-name (alpha beta gamma) \
                 (let ((sum (+ alpha beta gamma))) (when (> sum 100) (print sum)) sum))",
            )
            .unwrap();
        let mut out = Vec::new();
        rt.superprint(&mut out, long, 0);
        assert_eq!(
            latin1(&out),
            "(defun long-function-name (alpha beta gamma)\n  \
             (let ((sum (+ alpha beta gamma))) (when (> sum 100) (print sum)) sum))"
        );

        let q = rt.read_str("'(a b)").unwrap();
        let mut out = Vec::new();
        rt.superprint(&mut out, q, 0);
        assert_eq!(out, b"'(a b)");
    }
}
