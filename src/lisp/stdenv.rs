// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/stdenv.rs

// The builtin table, which fixes the identity of every builtin
// symbol, and the ordinary functions of the standard environment.

// <>

use super::{
    core::{Obj, SymId},
    eval::Step,
    forms::*,
    parser::Source,
    stream::CONSOLE,
    LispErr, Runtime,
};

use std::cmp::Ordering;
use std::time::Instant;

/// Native function receiving its argument list and environment
pub type NativeFn = fn(&mut Runtime, Obj, Obj) -> Result<Obj, LispErr>;

/// Native form that may hand a final form back to the evaluator
pub type TailFn = fn(&mut Runtime, Obj, Obj) -> Result<Step, LispErr>;

#[derive(Clone, Copy)]
pub enum Handler {
    /// Constants and section markers
    None,
    /// Receives its arguments unevaluated
    Special(NativeFn),
    /// Receives its arguments unevaluated and may return a tail form
    Tail(TailFn),
    /// Receives its arguments evaluated
    Func(NativeFn),
}

/// One row of the builtin table
pub struct Entry {
    pub name: &'static str,
    pub func: Handler,
    pub min: u8,
    pub max: u8,
}

/// Generates the Builtin enum and the table of builtin rows from one
/// list, so that a variant's discriminant is always its row index
///
/// Each row gives the variant, the Lisp name, the handler kind with
/// its native function, and the minimum and maximum argument counts
/// (127 for any number).
macro_rules! builtins {
    ( $( $variant:ident $name:literal $kind:ident $(($func:path))?, $min:literal $max:literal; )+ ) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u32)]
        pub enum Builtin {
            $($variant,)+
        }

        pub static BUILTINS: &[Entry] = &[
            $(Entry {
                name: $name,
                func: Handler::$kind $(($func))?,
                min: $min,
                max: $max,
            },)+
        ];
    };
}

impl Builtin {
    #[inline(always)]
    pub fn id(self) -> SymId {
        self as SymId
    }
}

impl From<Builtin> for Option<SymId> {
    fn from(b: Builtin) -> Self {
        Some(b.id())
    }
}

builtins! {
    Nil "nil" None, 0 0;
    Tee "t" None, 0 0;
    Nothing "nothing" None, 0 0;
    AmpOptional "&optional" None, 0 0;
    AmpRest "&rest" None, 0 0;
    Lambda "lambda" None, 0 127;
    Let "let" None, 0 127;
    LetStar "let*" None, 0 127;
    Closure "closure" None, 0 127;

    SpecialForms "" None, 0 0;
    Quote "quote" Special(sp_quote), 1 1;
    Defun "defun" Special(sp_defun), 0 127;
    Defvar "defvar" Special(sp_defvar), 2 2;
    Setq "setq" Special(sp_setq), 2 126;
    Loop "loop" Special(sp_loop), 0 127;
    Return "return" Special(sp_return), 0 127;
    Push "push" Special(sp_push), 2 2;
    Pop "pop" Special(sp_pop), 1 1;
    Incf "incf" Special(sp_incf), 1 2;
    Decf "decf" Special(sp_decf), 1 2;
    Setf "setf" Special(sp_setf), 2 126;
    Dolist "dolist" Special(sp_dolist), 1 127;
    Dotimes "dotimes" Special(sp_dotimes), 1 127;
    Trace "trace" Special(sp_trace), 0 1;
    Untrace "untrace" Special(sp_untrace), 0 1;
    ForMillis "for-millis" Special(sp_formillis), 1 127;
    WithSerial "with-serial" Special(sp_withserial), 1 127;
    WithI2c "with-i2c" Special(sp_withi2c), 1 127;
    WithSpi "with-spi" Special(sp_withspi), 1 127;
    WithSdCard "with-sd-card" Special(sp_withsdcard), 2 127;
    WithSpiffs "with-spiffs" Special(sp_withspiffs), 2 127;

    TailForms "" None, 0 0;
    Progn "progn" Tail(tf_progn), 0 127;
    If "if" Tail(tf_if), 2 3;
    Cond "cond" Tail(tf_cond), 0 127;
    When "when" Tail(tf_when), 1 127;
    Unless "unless" Tail(tf_unless), 1 127;
    Case "case" Tail(tf_case), 1 127;
    And "and" Tail(tf_and), 0 127;
    Or "or" Tail(tf_or), 0 127;

    Functions "" None, 0 0;
    Not "not" Func(fn_not), 1 1;
    Null "null" Func(fn_not), 1 1;
    Cons "cons" Func(fn_cons), 2 2;
    Atom "atom" Func(fn_atom), 1 1;
    Listp "listp" Func(fn_listp), 1 1;
    Consp "consp" Func(fn_consp), 1 1;
    Symbolp "symbolp" Func(fn_symbolp), 1 1;
    Streamp "streamp" Func(fn_streamp), 1 1;
    Eq "eq" Func(fn_eq), 2 2;
    Car "car" Func(fn_car), 1 1;
    First "first" Func(fn_first), 1 1;
    Cdr "cdr" Func(fn_cdr), 1 1;
    Rest "rest" Func(fn_rest), 1 1;
    Caar "caar" Func(fn_caar), 1 1;
    Cadr "cadr" Func(fn_cadr), 1 1;
    Second "second" Func(fn_second), 1 1;
    Cdar "cdar" Func(fn_cdar), 1 1;
    Cddr "cddr" Func(fn_cddr), 1 1;
    Caaar "caaar" Func(fn_caaar), 1 1;
    Caadr "caadr" Func(fn_caadr), 1 1;
    Cadar "cadar" Func(fn_cadar), 1 1;
    Caddr "caddr" Func(fn_caddr), 1 1;
    Third "third" Func(fn_third), 1 1;
    Cdaar "cdaar" Func(fn_cdaar), 1 1;
    Cdadr "cdadr" Func(fn_cdadr), 1 1;
    Cddar "cddar" Func(fn_cddar), 1 1;
    Cdddr "cdddr" Func(fn_cdddr), 1 1;
    Length "length" Func(fn_length), 1 1;
    List "list" Func(fn_list), 0 127;
    Reverse "reverse" Func(fn_reverse), 1 1;
    Nth "nth" Func(fn_nth), 2 2;
    Assoc "assoc" Func(fn_assoc), 2 2;
    Member "member" Func(fn_member), 2 2;
    Apply "apply" Func(fn_apply), 2 127;
    Funcall "funcall" Func(fn_funcall), 1 127;
    Append "append" Func(fn_append), 0 127;
    Mapc "mapc" Func(fn_mapc), 2 127;
    Mapcar "mapcar" Func(fn_mapcar), 2 127;
    Mapcan "mapcan" Func(fn_mapcan), 2 127;
    Add "+" Func(fn_add), 0 127;
    Subtract "-" Func(fn_subtract), 1 127;
    Multiply "*" Func(fn_multiply), 0 127;
    Divide "/" Func(fn_divide), 1 127;
    Mod "mod" Func(fn_mod), 2 2;
    OnePlus "1+" Func(fn_oneplus), 1 1;
    OneMinus "1-" Func(fn_oneminus), 1 1;
    Abs "abs" Func(fn_abs), 1 1;
    Random "random" Func(fn_random), 1 1;
    Max "max" Func(fn_max), 1 127;
    Min "min" Func(fn_min), 1 127;
    NotEq "/=" Func(fn_noteq), 1 127;
    NumEq "=" Func(fn_numeq), 1 127;
    Less "<" Func(fn_less), 1 127;
    LessEq "<=" Func(fn_lesseq), 1 127;
    Greater ">" Func(fn_greater), 1 127;
    GreaterEq ">=" Func(fn_greatereq), 1 127;
    Plusp "plusp" Func(fn_plusp), 1 1;
    Minusp "minusp" Func(fn_minusp), 1 1;
    Zerop "zerop" Func(fn_zerop), 1 1;
    Oddp "oddp" Func(fn_oddp), 1 1;
    Evenp "evenp" Func(fn_evenp), 1 1;
    Integerp "integerp" Func(fn_integerp), 1 1;
    Numberp "numberp" Func(fn_numberp), 1 1;
    Float "float" Func(fn_float), 1 1;
    Floatp "floatp" Func(fn_floatp), 1 1;
    Sin "sin" Func(fn_sin), 1 1;
    Cos "cos" Func(fn_cos), 1 1;
    Tan "tan" Func(fn_tan), 1 1;
    Asin "asin" Func(fn_asin), 1 1;
    Acos "acos" Func(fn_acos), 1 1;
    Atan "atan" Func(fn_atan), 1 2;
    Sinh "sinh" Func(fn_sinh), 1 1;
    Cosh "cosh" Func(fn_cosh), 1 1;
    Tanh "tanh" Func(fn_tanh), 1 1;
    Exp "exp" Func(fn_exp), 1 1;
    Sqrt "sqrt" Func(fn_sqrt), 1 1;
    Log "log" Func(fn_log), 1 2;
    Expt "expt" Func(fn_expt), 2 2;
    Ceiling "ceiling" Func(fn_ceiling), 1 2;
    Floor "floor" Func(fn_floor), 1 2;
    Truncate "truncate" Func(fn_truncate), 1 2;
    Round "round" Func(fn_round), 1 2;
    Char "char" Func(fn_char), 2 2;
    CharCode "char-code" Func(fn_charcode), 1 1;
    CodeChar "code-char" Func(fn_codechar), 1 1;
    Characterp "characterp" Func(fn_characterp), 1 1;
    Stringp "stringp" Func(fn_stringp), 1 1;
    StringEq "string=" Func(fn_stringeq), 2 2;
    StringLess "string<" Func(fn_stringless), 2 2;
    StringGreater "string>" Func(fn_stringgreater), 2 2;
    Sort "sort" Func(fn_sort), 2 2;
    StringFn "string" Func(fn_string), 1 1;
    Concatenate "concatenate" Func(fn_concatenate), 1 127;
    Subseq "subseq" Func(fn_subseq), 2 3;
    ReadFromString "read-from-string" Func(fn_readfromstring), 1 1;
    PrincToString "princ-to-string" Func(fn_princtostring), 1 1;
    Prin1ToString "prin1-to-string" Func(fn_prin1tostring), 1 1;
    Logand "logand" Func(fn_logand), 0 127;
    Logior "logior" Func(fn_logior), 0 127;
    Logxor "logxor" Func(fn_logxor), 0 127;
    Lognot "lognot" Func(fn_lognot), 1 1;
    Ash "ash" Func(fn_ash), 2 2;
    Logbitp "logbitp" Func(fn_logbitp), 2 2;
    Eval "eval" Func(fn_eval), 1 1;
    Globals "globals" Func(fn_globals), 0 0;
    Locals "locals" Func(fn_locals), 0 0;
    Makunbound "makunbound" Func(fn_makunbound), 1 1;
    Break "break" Func(fn_break), 0 0;
    Read "read" Func(fn_read), 0 1;
    Prin1 "prin1" Func(fn_prin1), 1 2;
    Print "print" Func(fn_print), 1 2;
    Princ "princ" Func(fn_princ), 1 2;
    Terpri "terpri" Func(fn_terpri), 0 1;
    ReadByte "read-byte" Func(fn_readbyte), 0 2;
    ReadLine "read-line" Func(fn_readline), 0 1;
    WriteByte "write-byte" Func(fn_writebyte), 1 2;
    WriteString "write-string" Func(fn_writestring), 1 2;
    WriteLine "write-line" Func(fn_writeline), 1 2;
    Gc "gc" Func(fn_gc), 0 0;
    Room "room" Func(fn_room), 0 0;
    SaveImage "save-image" Func(fn_saveimage), 0 1;
    LoadImage "load-image" Func(fn_loadimage), 0 1;
    Cls "cls" Func(fn_cls), 0 0;
    Pprint "pprint" Func(fn_pprint), 1 2;
    Pprintall "pprintall" Func(fn_pprintall), 0 0;
    Require "require" Func(fn_require), 1 1;
    ListLibrary "list-library" Func(fn_listlibrary), 0 0;

    EndFunctions "" None, 0 0;
}

/// Definitions loaded at startup or on demand by require
pub const LIBRARY: &str = "\
(defun last (lst) (if (cdr lst) (last (cdr lst)) (car lst)))
(defun filter (fn lst) (mapcan (lambda (x) (when (fn x) (list x))) lst))
(defun remove (x lst) (filter (lambda (y) (not (eq x y))) lst))
(defun reduce (fn init lst) (if (null lst) init (reduce fn (fn init (car lst)) (cdr lst))))
(defun some (fn lst) (cond ((null lst) nil) ((fn (car lst))) (t (some fn (cdr lst)))))
(defun every (fn lst) (cond ((null lst) t) ((fn (car lst)) (every fn (cdr lst)))))
(defun take (n lst) (if (or (<= n 0) (null lst)) nil (cons (car lst) (take (- n 1) (cdr lst)))))
(defun drop (n lst) (if (or (<= n 0) (null lst)) lst (drop (- n 1) (cdr lst))))
";

// argument checks

impl Runtime {
    pub(crate) fn checkinteger(
        &self,
        name: impl Into<Option<SymId>>,
        obj: Obj,
    ) -> Result<i32, LispErr> {
        self.arena
            .int(obj)
            .ok_or_else(|| self.err_obj(name, "argument is not an integer", obj))
    }

    /// Integer or float argument, widened to a float
    pub(crate) fn checkintfloat(
        &self,
        name: impl Into<Option<SymId>>,
        obj: Obj,
    ) -> Result<f32, LispErr> {
        self.arena
            .intfloat(obj)
            .ok_or_else(|| self.err_obj(name, "argument is not a number", obj))
    }

    pub(crate) fn checkstring(
        &self,
        name: impl Into<Option<SymId>>,
        obj: Obj,
    ) -> Result<Obj, LispErr> {
        if self.arena.stringp(obj) {
            Ok(obj)
        } else {
            Err(self.err_obj(name, "argument is not a string", obj))
        }
    }

    pub(crate) fn checkchar(&self, name: impl Into<Option<SymId>>, obj: Obj) -> Result<u8, LispErr> {
        self.arena
            .chr(obj)
            .ok_or_else(|| self.err_obj(name, "argument is not a character", obj))
    }

    pub(crate) fn boolean(&self, b: bool) -> Obj {
        if b {
            self.tee
        } else {
            Obj::NIL
        }
    }

    /// Descriptor named by an optional stream argument; absent or nil
    /// means the console
    fn stream_arg(&self, name: Builtin, args: Obj) -> Result<u16, LispErr> {
        let arg = self.arena.car(args);
        if arg.is_nil() {
            return Ok(CONSOLE);
        }

        self.arena
            .stream_desc(arg)
            .ok_or_else(|| self.err_obj(name, "not a stream", arg))
    }

    fn xorshift(&mut self) -> u32 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }

    /// Name a library form defines, if it is a defun or defvar
    fn defined_name(&self, form: Obj) -> Option<SymId> {
        let head = self.arena.sym(self.arena.car(form))?;
        if head == Builtin::Defun.id() || head == Builtin::Defvar.id() {
            self.arena.sym(self.arena.second(form))
        } else {
            None
        }
    }
}

fn carx(rt: &Runtime, name: Builtin, x: Obj) -> Result<Obj, LispErr> {
    if !rt.arena.listp(x) {
        return Err(rt.err_obj(name, "can't take car", x));
    }
    Ok(rt.arena.car(x))
}

fn cdrx(rt: &Runtime, name: Builtin, x: Obj) -> Result<Obj, LispErr> {
    if !rt.arena.listp(x) {
        return Err(rt.err_obj(name, "can't take cdr", x));
    }
    Ok(rt.arena.cdr(x))
}

// predicates

fn fn_not(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.car(args).is_nil()))
}

fn fn_cons(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    rt.arena.cons(rt.arena.car(args), rt.arena.second(args))
}

fn fn_atom(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.atom(rt.arena.car(args))))
}

fn fn_listp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.listp(rt.arena.car(args))))
}

fn fn_consp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.consp(rt.arena.car(args))))
}

fn fn_symbolp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    Ok(rt.boolean(arg.is_nil() || rt.arena.symbolp(arg)))
}

fn fn_streamp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.streamp(rt.arena.car(args))))
}

fn fn_eq(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.eq(rt.arena.car(args), rt.arena.second(args))))
}

// list access

/// Defines a chain of car and cdr steps, applied left to right
macro_rules! accessor {
    ( $fn:ident $name:ident; $($step:ident)+ ) => {
        fn $fn(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
            let x = rt.arena.car(args);
            $( let x = $step(rt, Builtin::$name, x)?; )+
            Ok(x)
        }
    };
}

accessor!(fn_car Car; carx);
accessor!(fn_first First; carx);
accessor!(fn_cdr Cdr; cdrx);
accessor!(fn_rest Rest; cdrx);
accessor!(fn_caar Caar; carx carx);
accessor!(fn_cadr Cadr; cdrx carx);
accessor!(fn_second Second; cdrx carx);
accessor!(fn_cdar Cdar; carx cdrx);
accessor!(fn_cddr Cddr; cdrx cdrx);
accessor!(fn_caaar Caaar; carx carx carx);
accessor!(fn_caadr Caadr; cdrx carx carx);
accessor!(fn_cadar Cadar; carx cdrx carx);
accessor!(fn_caddr Caddr; cdrx cdrx carx);
accessor!(fn_third Third; cdrx cdrx carx);
accessor!(fn_cdaar Cdaar; carx carx cdrx);
accessor!(fn_cdadr Cdadr; cdrx carx cdrx);
accessor!(fn_cddar Cddar; carx cdrx cdrx);
accessor!(fn_cdddr Cdddr; cdrx cdrx cdrx);

// list operations

fn fn_length(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    let n = if rt.arena.listp(arg) {
        rt.listlength(Builtin::Length.id(), arg)?
    } else if rt.arena.stringp(arg) {
        rt.arena.string_len(arg)
    } else {
        return Err(rt.err_obj(Builtin::Length, "argument is not a list or string", arg));
    };
    rt.arena.number(n as i32)
}

fn fn_list(_rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(args)
}

fn fn_reverse(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let mut list = rt.arena.car(args);
    let mut result = Obj::NIL;
    while !list.is_nil() {
        if rt.arena.improperp(list) {
            return Err(rt.err_obj(Builtin::Reverse, "argument is not a proper list", list));
        }
        result = rt.arena.cons(rt.arena.car(list), result)?;
        list = rt.arena.cdr(list);
    }
    Ok(result)
}

fn fn_nth(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let mut n = rt.checkinteger(Builtin::Nth, rt.arena.car(args))?;
    let mut list = rt.arena.second(args);
    while !list.is_nil() {
        if rt.arena.improperp(list) {
            return Err(rt.err_obj(Builtin::Nth, "argument is not a proper list", list));
        }
        if n == 0 {
            return Ok(rt.arena.car(list));
        }
        list = rt.arena.cdr(list);
        n -= 1;
    }
    Ok(Obj::NIL)
}

fn fn_assoc(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let key = rt.arena.car(args);
    let mut list = rt.arena.second(args);
    while !list.is_nil() {
        if rt.arena.improperp(list) {
            return Err(rt.err_obj(Builtin::Assoc, "argument is not a proper list", list));
        }
        let pair = rt.arena.car(list);
        if !rt.arena.listp(pair) {
            return Err(rt.err_obj(Builtin::Assoc, "element is not a list", pair));
        }
        if !pair.is_nil() && rt.arena.eq(key, rt.arena.car(pair)) {
            return Ok(pair);
        }
        list = rt.arena.cdr(list);
    }
    Ok(Obj::NIL)
}

fn fn_member(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let item = rt.arena.car(args);
    let mut list = rt.arena.second(args);
    while !list.is_nil() {
        if rt.arena.improperp(list) {
            return Err(rt.err_obj(Builtin::Member, "argument is not a proper list", list));
        }
        if rt.arena.eq(item, rt.arena.car(list)) {
            return Ok(list);
        }
        list = rt.arena.cdr(list);
    }
    Ok(Obj::NIL)
}

fn fn_apply(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let function = rt.arena.car(args);

    // spread arguments are copied so the final list is shared, not edited
    let head = rt.arena.cons(Obj::NIL, Obj::NIL)?;
    rt.push_gc(head)?;

    let mut tail = head;
    let mut rest = rt.arena.cdr(args);
    while !rt.arena.cdr(rest).is_nil() {
        let cell = rt.arena.cons(rt.arena.car(rest), Obj::NIL)?;
        rt.arena.set_cdr(tail, cell);
        tail = cell;
        rest = rt.arena.cdr(rest);
    }

    let last = rt.arena.car(rest);
    if !rt.arena.listp(last) {
        return Err(rt.err_obj(Builtin::Apply, "last argument is not a list", last));
    }
    rt.arena.set_cdr(tail, last);

    let result = rt.apply(Builtin::Apply.id(), function, rt.arena.cdr(head), env)?;
    rt.pop_gc();
    Ok(result)
}

fn fn_funcall(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    rt.apply(
        Builtin::Funcall.id(),
        rt.arena.car(args),
        rt.arena.cdr(args),
        env,
    )
}

fn fn_append(rt: &mut Runtime, mut args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let mut head = Obj::NIL;
    let mut tail = Obj::NIL;

    while !args.is_nil() {
        let mut list = rt.arena.car(args);
        if !rt.arena.listp(list) {
            return Err(rt.err_obj(Builtin::Append, "argument is not a list", list));
        }

        while rt.arena.consp(list) {
            let cell = rt.arena.cons(rt.arena.car(list), rt.arena.cdr(list))?;
            if head.is_nil() {
                head = cell;
            } else {
                rt.arena.set_cdr(tail, cell);
            }
            tail = cell;
            list = rt.arena.cdr(list);

            if !rt.arena.cdr(args).is_nil() && rt.arena.improperp(list) {
                let whole = rt.arena.car(args);
                return Err(rt.err_obj(Builtin::Append, "argument is not a proper list", whole));
            }
        }
        args = rt.arena.cdr(args);
    }

    Ok(head)
}

/// Calls the first argument on successive elements of the remaining
/// lists, stopping when the shortest runs out; each result goes to
/// the collector
fn map_over(
    rt: &mut Runtime,
    name: Builtin,
    args: Obj,
    env: Obj,
    mut collect: impl FnMut(&mut Runtime, Obj) -> Result<(), LispErr>,
) -> Result<(), LispErr> {
    let function = rt.arena.car(args);

    // private cursors, one per list
    let cursors = rt.arena.cons(Obj::NIL, Obj::NIL)?;
    rt.push_gc(cursors)?;
    let mut tail = cursors;
    let mut lists = rt.arena.cdr(args);
    while !lists.is_nil() {
        let cell = rt.arena.cons(rt.arena.car(lists), Obj::NIL)?;
        rt.arena.set_cdr(tail, cell);
        tail = cell;
        lists = rt.arena.cdr(lists);
    }

    loop {
        let params = rt.arena.cons(Obj::NIL, Obj::NIL)?;
        rt.arena.set_car(cursors, params);

        let mut tailp = params;
        let mut c = rt.arena.cdr(cursors);
        while !c.is_nil() {
            let list = rt.arena.car(c);
            if list.is_nil() {
                rt.pop_gc();
                return Ok(());
            }
            if rt.arena.improperp(list) {
                return Err(rt.err_obj(name, "argument is not a proper list", list));
            }

            let cell = rt.arena.cons(rt.arena.car(list), Obj::NIL)?;
            rt.arena.set_cdr(tailp, cell);
            tailp = cell;
            rt.arena.set_car(c, rt.arena.cdr(list));
            c = rt.arena.cdr(c);
        }

        let result = rt.apply(name.id(), function, rt.arena.cdr(params), env)?;
        collect(rt, result)?;
    }
}

fn fn_mapc(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    map_over(rt, Builtin::Mapc, args, env, |_, _| Ok(()))?;
    Ok(rt.arena.second(args))
}

fn fn_mapcar(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let head = rt.arena.cons(Obj::NIL, Obj::NIL)?;
    rt.push_gc(head)?;

    let mut tail = head;
    map_over(rt, Builtin::Mapcar, args, env, |rt, result| {
        let cell = rt.arena.cons(result, Obj::NIL)?;
        rt.arena.set_cdr(tail, cell);
        tail = cell;
        Ok(())
    })?;

    rt.pop_gc();
    Ok(rt.arena.cdr(head))
}

fn fn_mapcan(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let head = rt.arena.cons(Obj::NIL, Obj::NIL)?;
    rt.push_gc(head)?;

    let mut tail = head;
    map_over(rt, Builtin::Mapcan, args, env, |rt, mut result| {
        while rt.arena.consp(result) {
            rt.arena.set_cdr(tail, result);
            tail = result;
            result = rt.arena.cdr(result);
        }
        if !result.is_nil() {
            return Err(rt.err_obj(Builtin::Mapcan, "result is not a proper list", result));
        }
        Ok(())
    })?;

    rt.pop_gc();
    Ok(rt.arena.cdr(head))
}

// arithmetic

/// Continues an arithmetic fold in floating point once an integer
/// result would overflow or a float argument appears
fn fold_floats(
    rt: &mut Runtime,
    name: Builtin,
    mut args: Obj,
    mut acc: f32,
    op: fn(f32, f32) -> f32,
) -> Result<Obj, LispErr> {
    while !args.is_nil() {
        let x = rt.checkintfloat(name, rt.arena.car(args))?;
        if name == Builtin::Divide && x == 0.0 {
            return Err(rt.err(name, "division by zero"));
        }
        acc = op(acc, x);
        args = rt.arena.cdr(args);
    }
    rt.arena.makefloat(acc)
}

fn fn_add(rt: &mut Runtime, mut args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let mut result: i32 = 0;
    while !args.is_nil() {
        let arg = rt.arena.car(args);
        let sum = match rt.arena.int(arg) {
            Some(n) => result.checked_add(n),
            None if rt.arena.floatp(arg) => None,
            None => return Err(rt.err_obj(Builtin::Add, "argument is not a number", arg)),
        };
        match sum {
            Some(n) => result = n,
            None => return fold_floats(rt, Builtin::Add, args, result as f32, |a, b| a + b),
        }
        args = rt.arena.cdr(args);
    }
    rt.arena.number(result)
}

fn negate(rt: &mut Runtime, arg: Obj) -> Result<Obj, LispErr> {
    match (rt.arena.int(arg), rt.arena.float(arg)) {
        (Some(n), _) => match n.checked_neg() {
            Some(m) => rt.arena.number(m),
            None => rt.arena.makefloat(-(n as f32)),
        },
        (_, Some(f)) => rt.arena.makefloat(-f),
        _ => Err(rt.err_obj(Builtin::Subtract, "argument is not a number", arg)),
    }
}

fn fn_subtract(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::Subtract;
    let first = rt.arena.car(args);
    let mut args = rt.arena.cdr(args);

    if args.is_nil() {
        return negate(rt, first);
    }
    if let Some(f) = rt.arena.float(first) {
        return fold_floats(rt, name, args, f, |a, b| a - b);
    }

    let mut result = match rt.arena.int(first) {
        Some(n) => n,
        None => return Err(rt.err_obj(name, "argument is not a number", first)),
    };
    while !args.is_nil() {
        let arg = rt.arena.car(args);
        let diff = match rt.arena.int(arg) {
            Some(n) => result.checked_sub(n),
            None if rt.arena.floatp(arg) => None,
            None => return Err(rt.err_obj(name, "argument is not a number", arg)),
        };
        match diff {
            Some(n) => result = n,
            None => return fold_floats(rt, name, args, result as f32, |a, b| a - b),
        }
        args = rt.arena.cdr(args);
    }
    rt.arena.number(result)
}

fn fn_multiply(rt: &mut Runtime, mut args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let mut result: i32 = 1;
    while !args.is_nil() {
        let arg = rt.arena.car(args);
        let product = match rt.arena.int(arg) {
            Some(n) => result.checked_mul(n),
            None if rt.arena.floatp(arg) => None,
            None => return Err(rt.err_obj(Builtin::Multiply, "argument is not a number", arg)),
        };
        match product {
            Some(n) => result = n,
            None => return fold_floats(rt, Builtin::Multiply, args, result as f32, |a, b| a * b),
        }
        args = rt.arena.cdr(args);
    }
    rt.arena.number(result)
}

fn fn_divide(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::Divide;
    let first = rt.arena.car(args);
    let mut args = rt.arena.cdr(args);

    if args.is_nil() {
        let x = rt.checkintfloat(name, first)?;
        if x == 0.0 {
            return Err(rt.err(name, "division by zero"));
        }
        return match rt.arena.int(first) {
            Some(1) => rt.arena.number(1),
            _ => rt.arena.makefloat(1.0 / x),
        };
    }

    let mut result = match (rt.arena.int(first), rt.arena.float(first)) {
        (Some(n), _) => n,
        (_, Some(f)) => return fold_floats(rt, name, args, f, |a, b| a / b),
        _ => return Err(rt.err_obj(name, "argument is not a number", first)),
    };

    while !args.is_nil() {
        let arg = rt.arena.car(args);
        match (rt.arena.int(arg), rt.arena.float(arg)) {
            (Some(0), _) => return Err(rt.err(name, "division by zero")),
            (Some(n), _) => {
                if (result == i32::MIN && n == -1) || result % n != 0 {
                    return fold_floats(rt, name, args, result as f32, |a, b| a / b);
                }
                result /= n;
            }
            (_, Some(_)) => return fold_floats(rt, name, args, result as f32, |a, b| a / b),
            _ => return Err(rt.err_obj(name, "argument is not a number", arg)),
        }
        args = rt.arena.cdr(args);
    }
    rt.arena.number(result)
}

fn fn_mod(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::Mod;
    let (a, b) = (rt.arena.car(args), rt.arena.second(args));

    if let (Some(dividend), Some(divisor)) = (rt.arena.int(a), rt.arena.int(b)) {
        if divisor == 0 {
            return Err(rt.err(name, "division by zero"));
        }
        let mut remainder = dividend.wrapping_rem(divisor);
        if remainder != 0 && (remainder < 0) != (divisor < 0) {
            remainder += divisor;
        }
        return rt.arena.number(remainder);
    }

    let divisor = rt.checkintfloat(name, b)?;
    if divisor == 0.0 {
        return Err(rt.err(name, "division by zero"));
    }
    let dividend = rt.checkintfloat(name, a)?;
    let mut remainder = dividend % divisor;
    if remainder != 0.0 && (remainder < 0.0) != (divisor < 0.0) {
        remainder += divisor;
    }
    rt.arena.makefloat(remainder)
}

fn fn_oneplus(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    match (rt.arena.int(arg), rt.arena.float(arg)) {
        (Some(n), _) => match n.checked_add(1) {
            Some(m) => rt.arena.number(m),
            None => rt.arena.makefloat(n as f32 + 1.0),
        },
        (_, Some(f)) => rt.arena.makefloat(f + 1.0),
        _ => Err(rt.err_obj(Builtin::OnePlus, "argument is not a number", arg)),
    }
}

fn fn_oneminus(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    match (rt.arena.int(arg), rt.arena.float(arg)) {
        (Some(n), _) => match n.checked_sub(1) {
            Some(m) => rt.arena.number(m),
            None => rt.arena.makefloat(n as f32 - 1.0),
        },
        (_, Some(f)) => rt.arena.makefloat(f - 1.0),
        _ => Err(rt.err_obj(Builtin::OneMinus, "argument is not a number", arg)),
    }
}

fn fn_abs(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    match (rt.arena.int(arg), rt.arena.float(arg)) {
        (Some(n), _) => match n.checked_abs() {
            Some(m) => rt.arena.number(m),
            None => rt.arena.makefloat((n as f32).abs()),
        },
        (_, Some(f)) => rt.arena.makefloat(f.abs()),
        _ => Err(rt.err_obj(Builtin::Abs, "argument is not a number", arg)),
    }
}

fn fn_random(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    match (rt.arena.int(arg), rt.arena.float(arg)) {
        (Some(n), _) => {
            let r = rt.xorshift();
            let value = if n > 0 { (r % n as u32) as i32 } else { 0 };
            rt.arena.number(value)
        }
        (_, Some(f)) => {
            let r = rt.xorshift();
            rt.arena.makefloat((r >> 8) as f32 / (1u32 << 24) as f32 * f)
        }
        _ => Err(rt.err_obj(Builtin::Random, "argument is not a number", arg)),
    }
}

/// The argument that wins every pairwise comparison
fn extreme(rt: &mut Runtime, name: Builtin, mut args: Obj, wins: Ordering) -> Result<Obj, LispErr> {
    let mut result = rt.arena.car(args);
    rt.checkintfloat(name, result)?;
    args = rt.arena.cdr(args);

    while !args.is_nil() {
        let arg = rt.arena.car(args);
        if compare(rt, name, arg, result)? == Some(wins) {
            result = arg;
        }
        args = rt.arena.cdr(args);
    }
    Ok(result)
}

fn fn_max(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    extreme(rt, Builtin::Max, args, Ordering::Greater)
}

fn fn_min(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    extreme(rt, Builtin::Min, args, Ordering::Less)
}

// comparisons

/// Compares two numbers, exactly when both are integers; None when a
/// float comparison is unordered
fn compare(rt: &Runtime, name: Builtin, a: Obj, b: Obj) -> Result<Option<Ordering>, LispErr> {
    if let (Some(x), Some(y)) = (rt.arena.int(a), rt.arena.int(b)) {
        return Ok(Some(x.cmp(&y)));
    }
    let x = rt.checkintfloat(name, a)?;
    let y = rt.checkintfloat(name, b)?;
    Ok(x.partial_cmp(&y))
}

/// True if every adjacent pair of arguments satisfies the test
fn chain(rt: &mut Runtime, name: Builtin, args: Obj, ok: fn(Ordering) -> bool) -> Result<Obj, LispErr> {
    let mut a = rt.arena.car(args);
    let mut rest = rt.arena.cdr(args);
    if rest.is_nil() {
        rt.checkintfloat(name, a)?;
    }

    while !rest.is_nil() {
        let b = rt.arena.car(rest);
        if !compare(rt, name, a, b)?.map_or(false, ok) {
            return Ok(Obj::NIL);
        }
        a = b;
        rest = rt.arena.cdr(rest);
    }
    Ok(rt.tee)
}

fn fn_noteq(rt: &mut Runtime, mut args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    while !args.is_nil() {
        let a = rt.arena.car(args);
        let mut rest = rt.arena.cdr(args);
        while !rest.is_nil() {
            if compare(rt, Builtin::NotEq, a, rt.arena.car(rest))? == Some(Ordering::Equal) {
                return Ok(Obj::NIL);
            }
            rest = rt.arena.cdr(rest);
        }
        args = rt.arena.cdr(args);
    }
    Ok(rt.tee)
}

fn fn_numeq(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    chain(rt, Builtin::NumEq, args, |o| o == Ordering::Equal)
}

fn fn_less(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    chain(rt, Builtin::Less, args, |o| o == Ordering::Less)
}

fn fn_lesseq(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    chain(rt, Builtin::LessEq, args, |o| o != Ordering::Greater)
}

fn fn_greater(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    chain(rt, Builtin::Greater, args, |o| o == Ordering::Greater)
}

fn fn_greatereq(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    chain(rt, Builtin::GreaterEq, args, |o| o != Ordering::Less)
}

/// Sign test on a single number
fn sign(rt: &mut Runtime, name: Builtin, args: Obj, want: Ordering) -> Result<Obj, LispErr> {
    let x = rt.checkintfloat(name, rt.arena.car(args))?;
    Ok(rt.boolean(x.partial_cmp(&0.0) == Some(want)))
}

fn fn_plusp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    sign(rt, Builtin::Plusp, args, Ordering::Greater)
}

fn fn_minusp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    sign(rt, Builtin::Minusp, args, Ordering::Less)
}

fn fn_zerop(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    sign(rt, Builtin::Zerop, args, Ordering::Equal)
}

fn fn_oddp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let n = rt.checkinteger(Builtin::Oddp, rt.arena.car(args))?;
    Ok(rt.boolean(n & 1 == 1))
}

fn fn_evenp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let n = rt.checkinteger(Builtin::Evenp, rt.arena.car(args))?;
    Ok(rt.boolean(n & 1 == 0))
}

fn fn_integerp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.integerp(rt.arena.car(args))))
}

fn fn_numberp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.intfloat(rt.arena.car(args)).is_some()))
}

// floating point

fn fn_float(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    if rt.arena.floatp(arg) {
        return Ok(arg);
    }
    let x = rt.checkintfloat(Builtin::Float, arg)?;
    rt.arena.makefloat(x)
}

fn fn_floatp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.floatp(rt.arena.car(args))))
}

/// Defines a one-argument float function
macro_rules! unary {
    ( $fn:ident $name:ident $op:ident ) => {
        fn $fn(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
            let x = rt.checkintfloat(Builtin::$name, rt.arena.car(args))?;
            rt.arena.makefloat(x.$op())
        }
    };
}

unary!(fn_sin Sin sin);
unary!(fn_cos Cos cos);
unary!(fn_tan Tan tan);
unary!(fn_asin Asin asin);
unary!(fn_acos Acos acos);
unary!(fn_sinh Sinh sinh);
unary!(fn_cosh Cosh cosh);
unary!(fn_tanh Tanh tanh);
unary!(fn_exp Exp exp);
unary!(fn_sqrt Sqrt sqrt);

fn fn_atan(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let y = rt.checkintfloat(Builtin::Atan, rt.arena.car(args))?;
    let rest = rt.arena.cdr(args);
    let x = if rest.is_nil() {
        1.0
    } else {
        rt.checkintfloat(Builtin::Atan, rt.arena.car(rest))?
    };
    rt.arena.makefloat(y.atan2(x))
}

fn fn_log(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let x = rt.checkintfloat(Builtin::Log, rt.arena.car(args))?;
    let rest = rt.arena.cdr(args);
    if rest.is_nil() {
        return rt.arena.makefloat(x.ln());
    }
    let base = rt.checkintfloat(Builtin::Log, rt.arena.car(rest))?;
    rt.arena.makefloat(x.ln() / base.ln())
}

fn intpower(mut base: i32, mut exp: i32) -> i32 {
    let mut result: i32 = 1;
    while exp != 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        exp /= 2;
        base = base.wrapping_mul(base);
    }
    result
}

fn fn_expt(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::Expt;
    let (a, b) = (rt.arena.car(args), rt.arena.second(args));
    let base = rt.checkintfloat(name, a)?;
    let exp = rt.checkintfloat(name, b)?;
    let value = base.abs().ln() * exp;

    // small integer powers stay exact
    if let (Some(x), Some(n)) = (rt.arena.int(a), rt.arena.int(b)) {
        if n > 0 && value.abs() < 21.4875 {
            return rt.arena.number(intpower(x, n));
        }
    }

    if base < 0.0 {
        if exp.fract() != 0.0 {
            return Err(rt.err(name, "invalid result"));
        }
        return rt.arena.makefloat(base.powf(exp));
    }
    rt.arena.makefloat(value.exp())
}

/// Rounds a quotient to an integer with the given rule
fn rounding(rt: &mut Runtime, name: Builtin, args: Obj, rule: fn(f32) -> f32) -> Result<Obj, LispErr> {
    let mut x = rt.checkintfloat(name, rt.arena.car(args))?;
    let rest = rt.arena.cdr(args);
    if !rest.is_nil() {
        let divisor = rt.checkintfloat(name, rt.arena.car(rest))?;
        if divisor == 0.0 {
            return Err(rt.err(name, "division by zero"));
        }
        x /= divisor;
    }

    let r = rule(x);
    if !(-2_147_483_648.0..2_147_483_648.0).contains(&r) {
        return Err(rt.err(name, "invalid result"));
    }
    rt.arena.number(r as i32)
}

fn fn_ceiling(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    rounding(rt, Builtin::Ceiling, args, f32::ceil)
}

fn fn_floor(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    rounding(rt, Builtin::Floor, args, f32::floor)
}

fn fn_truncate(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    rounding(rt, Builtin::Truncate, args, f32::trunc)
}

fn fn_round(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    // halves round away from zero
    rounding(rt, Builtin::Round, args, f32::round)
}

// characters and strings

fn fn_char(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let string = rt.checkstring(Builtin::Char, rt.arena.car(args))?;
    let n = rt.checkinteger(Builtin::Char, rt.arena.second(args))?;
    let c = match usize::try_from(n) {
        Ok(n) => rt.arena.nth_char(string, n),
        Err(_) => 0,
    };
    if c == 0 {
        return Err(rt.err(Builtin::Char, "index out of range"));
    }
    rt.arena.character(c)
}

fn fn_charcode(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let c = rt.checkchar(Builtin::CharCode, rt.arena.car(args))?;
    rt.arena.number(c as i32)
}

fn fn_codechar(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let n = rt.checkinteger(Builtin::CodeChar, rt.arena.car(args))?;
    rt.arena.character(n as u8)
}

fn fn_characterp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.characterp(rt.arena.car(args))))
}

fn fn_stringp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    Ok(rt.boolean(rt.arena.stringp(rt.arena.car(args))))
}

fn string_order(rt: &Runtime, name: Builtin, args: Obj) -> Result<Ordering, LispErr> {
    let a = rt.checkstring(name, rt.arena.car(args))?;
    let b = rt.checkstring(name, rt.arena.second(args))?;
    Ok(rt.arena.string_bytes(a).cmp(&rt.arena.string_bytes(b)))
}

fn fn_stringeq(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let order = string_order(rt, Builtin::StringEq, args)?;
    Ok(rt.boolean(order == Ordering::Equal))
}

fn fn_stringless(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let order = string_order(rt, Builtin::StringLess, args)?;
    Ok(rt.boolean(order == Ordering::Less))
}

fn fn_stringgreater(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let order = string_order(rt, Builtin::StringGreater, args)?;
    Ok(rt.boolean(order == Ordering::Greater))
}

/// Stable insertion sort; each element moves before the first earlier
/// element the predicate says it precedes
fn fn_sort(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let first = rt.arena.car(args);
    if first.is_nil() {
        return Ok(Obj::NIL);
    }
    let predicate = rt.arena.second(args);

    let list = rt.arena.cons(Obj::NIL, first)?;
    rt.push_gc(list)?;
    let tail = rt.arena.cons(Obj::NIL, Obj::NIL)?;
    let compare = rt.arena.cons(Obj::NIL, tail)?;
    rt.push_gc(compare)?;

    let mut ptr = rt.arena.cdr(list);
    while rt.arena.consp(ptr) && !rt.arena.cdr(ptr).is_nil() {
        let mut go = list;
        while go != ptr {
            rt.arena.set_car(compare, rt.arena.second(ptr));
            rt.arena.set_car(tail, rt.arena.second(go));
            if !rt.apply(Builtin::Sort.id(), predicate, compare, env)?.is_nil() {
                break;
            }
            go = rt.arena.cdr(go);
        }

        if go != ptr {
            let obj = rt.arena.cdr(ptr);
            rt.arena.set_cdr(ptr, rt.arena.cdr(obj));
            rt.arena.set_cdr(obj, rt.arena.cdr(go));
            rt.arena.set_cdr(go, obj);
        } else {
            ptr = rt.arena.cdr(ptr);
        }
    }

    rt.pop_gc();
    rt.pop_gc();
    Ok(rt.arena.cdr(list))
}

fn fn_string(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    if rt.arena.stringp(arg) {
        return Ok(arg);
    }

    let bytes = if let Some(c) = rt.arena.chr(arg) {
        vec![c]
    } else if let Some(id) = rt.arena.sym(arg) {
        rt.symtab.name(id).unwrap_or_default()
    } else {
        return Err(rt.err_obj(Builtin::StringFn, "can't convert to string", arg));
    };
    rt.arena.string_from_bytes(&bytes)
}

fn fn_concatenate(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::Concatenate;
    if !rt.arena.is_sym(rt.arena.car(args), Builtin::StringFn.id()) {
        return Err(rt.err(name, "only supports strings"));
    }

    let mut text = Vec::new();
    let mut rest = rt.arena.cdr(args);
    while !rest.is_nil() {
        let string = rt.checkstring(name, rt.arena.car(rest))?;
        text.extend(rt.arena.string_bytes(string));
        rest = rt.arena.cdr(rest);
    }
    rt.arena.string_from_bytes(&text)
}

fn fn_subseq(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let name = Builtin::Subseq;
    let string = rt.checkstring(name, rt.arena.car(args))?;
    let start = rt.checkinteger(name, rt.arena.second(args))?;
    let rest = rt.arena.cdr(rt.arena.cdr(args));
    let end = if rest.is_nil() {
        rt.arena.string_len(string) as i32
    } else {
        rt.checkinteger(name, rt.arena.car(rest))?
    };

    let mut text = Vec::new();
    for i in start..end {
        let c = match usize::try_from(i) {
            Ok(i) => rt.arena.nth_char(string, i),
            Err(_) => 0,
        };
        if c == 0 {
            return Err(rt.err(name, "index out of range"));
        }
        text.push(c);
    }
    rt.arena.string_from_bytes(&text)
}

fn fn_readfromstring(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let string = rt.checkstring(Builtin::ReadFromString, rt.arena.car(args))?;
    let mut src = Source::text(&rt.arena.string_bytes(string));
    Ok(rt.read(&mut src)?.unwrap_or(Obj::NIL))
}

fn fn_princtostring(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let text = rt.render(rt.arena.car(args), false);
    rt.arena.string_from_bytes(&text)
}

fn fn_prin1tostring(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let text = rt.render(rt.arena.car(args), true);
    rt.arena.string_from_bytes(&text)
}

// bitwise

fn bitfold(rt: &mut Runtime, name: Builtin, mut args: Obj, init: i32, op: fn(i32, i32) -> i32) -> Result<Obj, LispErr> {
    let mut result = init;
    while !args.is_nil() {
        result = op(result, rt.checkinteger(name, rt.arena.car(args))?);
        args = rt.arena.cdr(args);
    }
    rt.arena.number(result)
}

fn fn_logand(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    bitfold(rt, Builtin::Logand, args, -1, |a, b| a & b)
}

fn fn_logior(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    bitfold(rt, Builtin::Logior, args, 0, |a, b| a | b)
}

fn fn_logxor(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    bitfold(rt, Builtin::Logxor, args, 0, |a, b| a ^ b)
}

fn fn_lognot(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let n = rt.checkinteger(Builtin::Lognot, rt.arena.car(args))?;
    rt.arena.number(!n)
}

fn fn_ash(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let value = rt.checkinteger(Builtin::Ash, rt.arena.car(args))?;
    let count = rt.checkinteger(Builtin::Ash, rt.arena.second(args))?;
    let result = if count >= 0 {
        value.checked_shl(count as u32).unwrap_or(0)
    } else {
        value >> count.unsigned_abs().min(31)
    };
    rt.arena.number(result)
}

fn fn_logbitp(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let index = rt.checkinteger(Builtin::Logbitp, rt.arena.car(args))?;
    let value = rt.checkinteger(Builtin::Logbitp, rt.arena.second(args))?;
    let set = (0..32).contains(&index) && value >> index & 1 == 1;
    Ok(rt.boolean(set))
}

// system

fn fn_eval(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    rt.eval(rt.arena.car(args), env)
}

fn fn_globals(rt: &mut Runtime, _args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let head = rt.arena.cons(Obj::NIL, Obj::NIL)?;
    let mut tail = head;
    let mut globals = rt.global_env;
    while !globals.is_nil() {
        let cell = rt.arena.cons(rt.arena.car(rt.arena.car(globals)), Obj::NIL)?;
        rt.arena.set_cdr(tail, cell);
        tail = cell;
        globals = rt.arena.cdr(globals);
    }
    Ok(rt.arena.cdr(head))
}

fn fn_locals(_rt: &mut Runtime, _args: Obj, env: Obj) -> Result<Obj, LispErr> {
    Ok(env)
}

fn fn_makunbound(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let key = rt.arena.car(args);

    let mut prev = Obj::NIL;
    let mut list = rt.global_env;
    while !list.is_nil() {
        if rt.arena.eq(key, rt.arena.car(rt.arena.car(list))) {
            if prev.is_nil() {
                rt.global_env = rt.arena.cdr(list);
            } else {
                rt.arena.set_cdr(prev, rt.arena.cdr(list));
            }
            break;
        }
        prev = list;
        list = rt.arena.cdr(list);
    }
    Ok(key)
}

fn fn_break(rt: &mut Runtime, _args: Obj, env: Obj) -> Result<Obj, LispErr> {
    rt.ports.write(CONSOLE, b"\nBreak!\n")?;
    rt.break_level += 1;
    let result = rt.repl(env);
    rt.break_level -= 1;
    result.map(|_| Obj::NIL)
}

// input and output

fn fn_read(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let desc = rt.stream_arg(Builtin::Read, args)?;
    Ok(rt.read(&mut Source::Port(desc))?.unwrap_or(Obj::NIL))
}

/// Writes an object to the stream named by the rest of the arguments
fn print_to(rt: &mut Runtime, name: Builtin, args: Obj, prefix: &[u8], readably: bool, suffix: &[u8]) -> Result<Obj, LispErr> {
    let obj = rt.arena.car(args);
    let desc = rt.stream_arg(name, rt.arena.cdr(args))?;

    let mut out = prefix.to_vec();
    rt.print_object(&mut out, obj, readably);
    out.extend_from_slice(suffix);
    rt.ports.write(desc, &out)?;
    Ok(obj)
}

fn fn_prin1(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    print_to(rt, Builtin::Prin1, args, b"", true, b"")
}

fn fn_print(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    print_to(rt, Builtin::Print, args, b"\n", true, b" ")
}

fn fn_princ(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    print_to(rt, Builtin::Princ, args, b"", false, b"")
}

fn fn_terpri(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let desc = rt.stream_arg(Builtin::Terpri, args)?;
    rt.ports.put(desc, b'\n')?;
    Ok(Obj::NIL)
}

fn fn_readbyte(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let desc = rt.stream_arg(Builtin::ReadByte, args)?;
    match rt.ports.get(desc)? {
        Some(b) => rt.arena.number(b as i32),
        None => Ok(Obj::NIL),
    }
}

fn fn_readline(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let desc = rt.stream_arg(Builtin::ReadLine, args)?;
    rt.read_string(&mut Source::Port(desc), b'\n')
}

fn fn_writebyte(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let value = rt.checkinteger(Builtin::WriteByte, rt.arena.car(args))?;
    let desc = rt.stream_arg(Builtin::WriteByte, rt.arena.cdr(args))?;
    rt.ports.put(desc, value as u8)?;
    Ok(Obj::NIL)
}

fn fn_writestring(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    print_to(rt, Builtin::WriteString, args, b"", false, b"")?;
    Ok(Obj::NIL)
}

fn fn_writeline(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    print_to(rt, Builtin::WriteLine, args, b"", false, b"\n")?;
    Ok(Obj::NIL)
}

// memory and images

fn fn_gc(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let start = Instant::now();
    let reclaimed = rt.gc(args, env);
    let elapsed = start.elapsed().as_micros();

    let report = format!("Space: {} cells, Time: {} us\n", reclaimed, elapsed);
    rt.pstring(CONSOLE, &report)?;
    Ok(Obj::NIL)
}

fn fn_room(rt: &mut Runtime, _args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    rt.arena.number(rt.arena.free_count() as i32)
}

fn fn_saveimage(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let mut arg = rt.arena.car(args);
    // a function name stands for its definition
    if rt.arena.symbolp(arg) {
        arg = rt.eval(arg, env)?;
    }
    let size = rt.save_image(arg)?;
    rt.arena.number(size as i32)
}

fn fn_loadimage(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let size = rt.load_image(rt.arena.car(args))?;
    rt.arena.number(size as i32)
}

// display and library

fn fn_cls(rt: &mut Runtime, _args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    rt.ports.put(CONSOLE, 12)?;
    rt.arena.symbol(Builtin::Nothing.id())
}

fn fn_pprint(rt: &mut Runtime, args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let obj = rt.arena.car(args);
    let desc = rt.stream_arg(Builtin::Pprint, rt.arena.cdr(args))?;

    let mut out = vec![b'\n'];
    rt.superprint(&mut out, obj, 0);
    rt.ports.write(desc, &out)?;
    rt.arena.symbol(Builtin::Nothing.id())
}

fn fn_pprintall(rt: &mut Runtime, _args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let mut globals = rt.global_env;
    while !globals.is_nil() {
        let pair = rt.arena.car(globals);
        let var = rt.arena.car(pair);
        let val = rt.arena.cdr(pair);

        // rebuild the definition that would recreate this binding
        let form = if rt.arena.consp(val) && rt.arena.is_sym(rt.arena.car(val), Builtin::Lambda.id()) {
            let defun = rt.arena.symbol(Builtin::Defun.id())?;
            let rest = rt.arena.cons(var, rt.arena.cdr(val))?;
            rt.arena.cons(defun, rest)?
        } else {
            let quote = rt.arena.symbol(Builtin::Quote.id())?;
            let quoted = rt.arena.cons(val, Obj::NIL)?;
            let quoted = rt.arena.cons(quote, quoted)?;
            let rest = rt.arena.cons(quoted, Obj::NIL)?;
            let rest = rt.arena.cons(var, rest)?;
            let defvar = rt.arena.symbol(Builtin::Defvar.id())?;
            rt.arena.cons(defvar, rest)?
        };

        let mut out = vec![b'\n'];
        rt.superprint(&mut out, form, 0);
        out.push(b'\n');
        rt.ports.write(CONSOLE, &out)?;

        globals = rt.arena.cdr(globals);
    }
    rt.arena.symbol(Builtin::Nothing.id())
}

fn fn_require(rt: &mut Runtime, args: Obj, env: Obj) -> Result<Obj, LispErr> {
    let arg = rt.arena.car(args);
    let id = rt
        .arena
        .sym(arg)
        .ok_or_else(|| rt.err_obj(Builtin::Require, "argument is not a symbol", arg))?;

    if rt.value(id, rt.global_env).is_some() {
        return Ok(Obj::NIL);
    }

    let mut src = Source::text(LIBRARY.as_bytes());
    while let Some(form) = rt.read(&mut src)? {
        if rt.defined_name(form) == Some(id) {
            rt.eval(form, env)?;
            return Ok(rt.tee);
        }
    }
    Ok(Obj::NIL)
}

fn fn_listlibrary(rt: &mut Runtime, _args: Obj, _env: Obj) -> Result<Obj, LispErr> {
    let mut out = Vec::new();
    let mut src = Source::text(LIBRARY.as_bytes());
    while let Some(form) = rt.read(&mut src)? {
        if let Some(name) = rt.defined_name(form).and_then(|id| rt.symtab.name(id)) {
            out.extend(name);
            out.push(b' ');
        }
    }
    rt.ports.write(CONSOLE, &out)?;
    rt.arena.symbol(Builtin::Nothing.id())
}
