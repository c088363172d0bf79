// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/mod.rs

// The runtime context, its configuration and error type, and the
// read - evaluate - print loop with its batch variants.

// <>

pub mod core;
pub mod eval;
pub mod forms;
pub mod image;
pub mod memmgt;
pub mod parser;
pub mod printer;
pub mod stdenv;
pub mod stream;
pub mod symtab;

pub use self::core::{Obj, SymId};

use self::{
    eval::TRACEMAX,
    memmgt::Arena,
    parser::Source,
    printer::pint,
    stdenv::Builtin,
    stream::{BufferPort, Kind, Port, Ports, StdioPort, CONSOLE},
    symtab::SymbolTable,
};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{atomic::AtomicBool, Arc};

use thiserror::Error;

/// Runtime sizing and behaviour
#[derive(Clone, Debug)]
pub struct Config {
    /// Arena capacity in cells
    pub workspace: usize,
    /// Long symbol table capacity in bytes
    pub symbol_table: usize,
    /// Native evaluation depth limit
    pub max_depth: usize,
    /// Directory standing in for block storage
    pub storage: PathBuf,
    /// Default image file name inside storage
    pub image: String,
    pub print_free_space: bool,
    pub load_library: bool,
    pub autorun: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: 8000,
            symbol_table: 1024,
            max_depth: 1000,
            storage: PathBuf::from("."),
            image: String::from("LISP.IMG"),
            print_free_space: true,
            load_library: true,
            autorun: false,
        }
    }
}

impl Config {
    pub fn image_path(&self) -> PathBuf {
        self.storage.join(&self.image)
    }
}

fn named(fname: &Option<String>) -> String {
    match fname {
        Some(name) => format!("'{}' ", name),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum LispErr {
    #[error("{}{msg}", named(.fname))]
    Plain {
        fname: Option<String>,
        msg: &'static str,
    },
    #[error("{}{msg}: {obj}", named(.fname))]
    Object {
        fname: Option<String>,
        msg: &'static str,
        obj: String,
    },
    #[error("no room")]
    OutOfMemory,
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl LispErr {
    pub fn plain(fname: Option<String>, msg: &'static str) -> Self {
        LispErr::Plain { fname, msg }
    }
}

/// One complete interpreter instance
pub struct Runtime {
    pub(crate) arena: Arena,
    pub(crate) symtab: SymbolTable,
    pub(crate) ports: Ports,
    pub(crate) config: Config,

    pub(crate) global_env: Obj,
    /// Protection stack for values under construction
    pub(crate) gc_stack: Obj,
    /// The canonical t
    pub(crate) tee: Obj,

    pub(crate) return_flag: bool,
    pub(crate) trace_fn: [SymId; TRACEMAX],
    pub(crate) trace_depth: [u32; TRACEMAX],
    pub(crate) break_level: u32,

    pub(crate) depth: usize,
    pub(crate) max_seen_depth: usize,
    pub(crate) escape: Arc<AtomicBool>,
    pub(crate) no_esc: bool,
    pub(crate) rng: u32,
}

impl Runtime {
    /// Creates a runtime on the process's standard streams
    pub fn new(config: Config) -> Result<Self, LispErr> {
        Self::with_console(config, Box::new(StdioPort::new()))
    }

    pub fn with_console(config: Config, console: Box<dyn Port>) -> Result<Self, LispErr> {
        let mut arena = Arena::new(config.workspace);
        let tee = arena.symbol(Builtin::Tee.id())?;

        log::info!(
            "runtime created: {} cells, {} byte symbol table",
            config.workspace,
            config.symbol_table
        );

        let mut rt = Runtime {
            arena,
            symtab: SymbolTable::new(config.symbol_table),
            ports: Ports::new(console),
            config,

            global_env: Obj::NIL,
            gc_stack: Obj::NIL,
            tee,

            return_flag: false,
            trace_fn: [0; TRACEMAX],
            trace_depth: [0; TRACEMAX],
            break_level: 0,

            depth: 0,
            max_seen_depth: 0,
            escape: Arc::new(AtomicBool::new(false)),
            no_esc: false,
            rng: 2463534242,
        };

        if rt.config.load_library {
            let mut src = Source::text(stdenv::LIBRARY.as_bytes());
            rt.eval_source(&mut src)?;
        }

        if rt.config.autorun {
            if let Err(e) = rt.autorun() {
                log::warn!("autorun failed: {}", e);
            }
        }

        Ok(rt)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Raising this flag aborts the running evaluation with an error
    pub fn escape_handle(&self) -> Arc<AtomicBool> {
        self.escape.clone()
    }

    /// Installs a transport for a stream kind and address
    pub fn register_port(&mut self, kind: Kind, address: u8, port: Box<dyn Port>) {
        self.ports
            .register(stream::descriptor(kind, address), port);
    }

    pub fn free_space(&self) -> usize {
        self.arena.free_count()
    }

    /// Collects with the given form and environment as extra roots
    pub fn gc(&mut self, form: Obj, env: Obj) -> usize {
        self.arena
            .collect(&[self.tee, self.global_env, self.gc_stack, form, env])
    }

    /// Makes sure a number of cells are free, collecting once if not
    ///
    /// Everything the caller still holds must be reachable from the
    /// protection stack or passed in `keep`. Fails with OutOfMemory only
    /// when the collection could not free enough.
    pub(crate) fn reserve(&mut self, cells: usize, keep: &[Obj]) -> Result<(), LispErr> {
        if self.arena.free_count() >= cells {
            return Ok(());
        }

        let mut roots = vec![self.tee, self.global_env, self.gc_stack];
        roots.extend_from_slice(keep);
        self.arena.collect(&roots);

        if self.arena.free_count() < cells {
            return Err(LispErr::OutOfMemory);
        }
        Ok(())
    }

    pub(crate) fn push_gc(&mut self, obj: Obj) -> Result<(), LispErr> {
        self.gc_stack = self.arena.cons(obj, self.gc_stack)?;
        Ok(())
    }

    pub(crate) fn pop_gc(&mut self) {
        self.gc_stack = self.arena.cdr(self.gc_stack);
    }

    fn fname(&self, fname: impl Into<Option<SymId>>) -> Option<String> {
        fname.into().map(|id| self.symtab.name_string(id))
    }

    pub(crate) fn err(&self, fname: impl Into<Option<SymId>>, msg: &'static str) -> LispErr {
        LispErr::Plain {
            fname: self.fname(fname),
            msg,
        }
    }

    pub(crate) fn err_obj(
        &self,
        fname: impl Into<Option<SymId>>,
        msg: &'static str,
        obj: Obj,
    ) -> LispErr {
        LispErr::Object {
            fname: self.fname(fname),
            msg,
            obj: self.printed(obj).to_string(),
        }
    }

    /// Writes text whose characters are all Latin-1
    pub(crate) fn pstring(&mut self, desc: u16, text: &str) -> Result<(), LispErr> {
        let bytes: Vec<u8> = text.chars().map(|c| c as u32 as u8).collect();
        Ok(self.ports.write(desc, &bytes)?)
    }

    /// Clears evaluation state left behind by an error
    fn recover(&mut self, stack: Obj, depth: usize) {
        self.gc_stack = stack;
        self.return_flag = false;
        self.trace_depth = [0; TRACEMAX];
        self.depth = depth;
        self.no_esc = false;
    }

    /// Interactive loop on the console, in the given environment
    ///
    /// Returns at end of input, or when nil is entered inside a break.
    pub fn repl(&mut self, env: Obj) -> Result<(), LispErr> {
        let stack = self.gc_stack;
        let depth = self.depth;
        let mut src = Source::Port(CONSOLE);

        loop {
            self.gc(Obj::NIL, env);

            let mut prompt = Vec::new();
            if self.config.print_free_space {
                pint(&mut prompt, self.arena.free_count() as i32);
            }
            if self.break_level > 0 {
                prompt.extend_from_slice(b" : ");
                pint(&mut prompt, self.break_level as i32);
            }
            prompt.extend_from_slice(b"> ");
            self.ports.write(CONSOLE, &prompt)?;

            match self.repl_step(&mut src, env) {
                Ok(true) => (),
                Ok(false) => return Ok(()),
                Err(e) => {
                    log::debug!("repl error: {}", e);
                    self.recover(stack, depth);
                    self.ports.fresh_line()?;
                    self.pstring(CONSOLE, &format!("Error: {}\n", e))?;
                }
            }
        }
    }

    fn repl_step(&mut self, src: &mut Source, env: Obj) -> Result<bool, LispErr> {
        let line = match self.read(src)? {
            Some(line) => line,
            None => return Ok(false),
        };

        if self.break_level > 0 && line.is_nil() {
            self.ports.put(CONSOLE, b'\n')?;
            return Ok(false);
        }

        self.push_gc(line)?;
        self.ports.fresh_line()?;
        let result = self.eval(line, env)?;
        self.ports.fresh_line()?;
        let text = self.render(result, true);
        self.ports.write(CONSOLE, &text)?;
        self.pop_gc();
        self.ports.fresh_line()?;
        self.ports.put(CONSOLE, b'\n')?;
        self.return_flag = false;

        Ok(true)
    }

    /// Evaluates every form from a source, returning the last value
    fn eval_source(&mut self, src: &mut Source) -> Result<Obj, LispErr> {
        let mut last = Obj::NIL;

        // the slot roots each form and then its value
        self.reserve(1, &[])?;
        self.push_gc(Obj::NIL)?;
        while let Some(form) = self.read(src)? {
            self.arena.set_car(self.gc_stack, form);
            last = self.eval(form, Obj::NIL)?;
            self.arena.set_car(self.gc_stack, last);
            self.return_flag = false;
        }
        self.pop_gc();

        Ok(last)
    }

    /// Evaluates every form in a byte buffer; the last value, printed
    pub fn eval_bytes(&mut self, code: &[u8]) -> Result<String, LispErr> {
        let (stack, depth) = (self.gc_stack, self.depth);

        match self.eval_source(&mut Source::text(code)) {
            Ok(obj) => Ok(self.printed(obj).to_string()),
            Err(e) => {
                self.recover(stack, depth);
                Err(e)
            }
        }
    }

    pub fn eval_str(&mut self, code: &str) -> Result<String, LispErr> {
        self.eval_bytes(code.as_bytes())
    }

    /// Evaluates every form in a file
    pub fn run_file(&mut self, path: &Path) -> Result<String, LispErr> {
        let code = fs::read(path)?;
        self.eval_bytes(&code)
    }
}

/// Interprets code in a fresh runtime, returning the last result
pub fn interpret(code: &str) -> Result<String, LispErr> {
    let (console, _) = BufferPort::new(b"");
    let mut rt = Runtime::with_console(Config::default(), Box::new(console))?;
    rt.eval_str(code)
}

#[cfg(test)]
mod tests {
    use super::stream::Output;
    use super::*;

    use std::sync::atomic::Ordering;

    fn quiet() -> Config {
        Config {
            print_free_space: false,
            load_library: false,
            ..Config::default()
        }
    }

    fn with_input(config: Config, input: &[u8]) -> (Runtime, Output) {
        let (console, out) = BufferPort::new(input);
        (Runtime::with_console(config, Box::new(console)).unwrap(), out)
    }

    fn run(rt: &mut Runtime, code: &str) -> String {
        rt.eval_str(code).unwrap()
    }

    fn fail(rt: &mut Runtime, code: &str) -> String {
        rt.eval_str(code).unwrap_err().to_string()
    }

    #[test]
    fn returns() {
        assert_eq!(interpret("42").unwrap(), "42");
        assert_eq!(interpret("").unwrap(), "nil");
        assert_eq!(interpret("\"text\"").unwrap(), "\"text\"");
    }

    #[test]
    fn scenarios() {
        assert_eq!(interpret("(+ 1 2 3)").unwrap(), "6");
        assert_eq!(interpret("(defun sq (x) (* x x)) (sq 7)").unwrap(), "49");
        assert_eq!(
            interpret("(let ((a 1)) (let* ((a (+ a 1)) (b a)) (list a b)))").unwrap(),
            "(2 2)"
        );
        assert_eq!(interpret("(let ((a 1)) (let ((a 5) (b a)) b))").unwrap(), "1");
        assert_eq!(interpret("'(1 2 . 3)").unwrap(), "(1 2 . 3)");
        assert_eq!(interpret("(/ 7 2)").unwrap(), "3.5");
        assert_eq!(interpret("(/ 8 2)").unwrap(), "4");
    }

    #[test]
    fn overflow_promotes() {
        assert_eq!(interpret("(+ 2147483647 1)").unwrap(), "2.14748e9");
        assert_eq!(interpret("(* 65536 65536)").unwrap(), "4.29497e9");
        assert_eq!(interpret("(- -2147483648 1)").unwrap(), "-2.14748e9");
        assert_eq!(interpret("(integerp (+ 2147483646 1))").unwrap(), "t");
    }

    #[test]
    fn tail_calls_run_in_bounded_space() {
        let (mut rt, _) = with_input(quiet(), b"");

        run(
            &mut rt,
            "(defun countdown (n) (if (= n 0) 'done (countdown (- n 1))))",
        );
        assert_eq!(run(&mut rt, "(countdown 1000)"), "done");
        rt.gc(Obj::NIL, Obj::NIL);
        let before = rt.free_space();

        assert_eq!(run(&mut rt, "(countdown 100000)"), "done");
        rt.gc(Obj::NIL, Obj::NIL);
        assert_eq!(rt.free_space(), before);
        assert_eq!(rt.depth, 0);
    }

    #[test]
    fn closures() {
        let (mut rt, _) = with_input(quiet(), b"");

        run(&mut rt, "(defun adder (n) (lambda (x) (+ x n)))");
        assert_eq!(run(&mut rt, "((adder 3) 4)"), "7");
        assert_eq!(run(&mut rt, "(adder 3)"), "<closure>");
        assert_eq!(run(&mut rt, "(lambda (x) x)"), "(lambda (x) x)");

        run(&mut rt, "(defvar counter (let ((c 0)) (lambda () (incf c))))");
        run(&mut rt, "(funcall counter)");
        assert_eq!(run(&mut rt, "(funcall counter)"), "2");

        assert_eq!(run(&mut rt, "(mapcar (adder 10) '(1 2 3))"), "(11 12 13)");
    }

    #[test]
    fn parameters() {
        let (mut rt, _) = with_input(quiet(), b"");

        run(&mut rt, "(defun f (a &optional (b 10) &rest r) (list a b r))");
        assert_eq!(run(&mut rt, "(f 1)"), "(1 10 nil)");
        assert_eq!(run(&mut rt, "(f 1 2 3 4)"), "(1 2 (3 4))");
        assert_eq!(fail(&mut rt, "(f)"), "'f' has too few arguments");

        run(&mut rt, "(defun g (x) x)");
        assert_eq!(fail(&mut rt, "(g 1 2)"), "'g' has too many arguments");
        assert_eq!(
            fail(&mut rt, "((lambda (x) x))"),
            "function has too few arguments"
        );
        assert_eq!(
            fail(&mut rt, "(defun h ((x 1)) x) (h 2)"),
            "'h' invalid default value: (x 1)"
        );
    }

    #[test]
    fn errors() {
        let (mut rt, _) = with_input(quiet(), b"");

        assert_eq!(fail(&mut rt, "zzz"), "undefined: zzz");
        assert_eq!(fail(&mut rt, "(car 1)"), "'car' can't take car: 1");
        assert_eq!(fail(&mut rt, "(cons 1)"), "'cons' has too few arguments");
        assert_eq!(fail(&mut rt, "(/ 1 0)"), "'/' division by zero");
        assert_eq!(fail(&mut rt, "(mod 1 0)"), "'mod' division by zero");
        assert_eq!(fail(&mut rt, "(+ 1 'a)"), "'+' argument is not a number: a");
        assert_eq!(fail(&mut rt, "(1 2)"), "illegal function: 1");
        assert_eq!(fail(&mut rt, "(nil 2)"), "illegal function: nil");
        assert_eq!(fail(&mut rt, "(t 2)"), "'t' can't be used as a function");
        assert_eq!(fail(&mut rt, "(+ 1 . 2)"), "can't evaluate a dotted pair: 2");
        assert_eq!(fail(&mut rt, "(setq undefined-var 1)"), "unknown variable: undefined-var");
        assert_eq!(fail(&mut rt, ")"), "unmatched right bracket");

        // the protection stack is restored after every failure
        assert!(rt.gc_stack.is_nil());
    }

    #[test]
    fn stack_overflow() {
        let (mut rt, _) = with_input(
            Config {
                max_depth: 50,
                ..quiet()
            },
            b"",
        );

        run(&mut rt, "(defun deep (n) (+ 1 (deep n)))");
        assert_eq!(fail(&mut rt, "(deep 1)"), "Stack overflow");
        assert_eq!(rt.depth, 0);
        assert_eq!(run(&mut rt, "(+ 1 1)"), "2");
    }

    #[test]
    fn collects_before_running_out() {
        let (mut rt, _) = with_input(
            Config {
                workspace: 2000,
                ..quiet()
            },
            b"",
        );

        // garbage fills the pool to just above the low-water mark
        while rt.arena.free_count() > 149 {
            rt.arena.number(7).unwrap();
        }

        let items: Vec<String> = (1..=80).map(|n| n.to_string()).collect();
        let code = format!("(length '({}))", items.join(" "));
        assert_eq!(run(&mut rt, &code), "80");
        assert!(rt.free_space() > 1500);
    }

    #[test]
    fn runs_out_only_when_full_of_live_cells() {
        let (mut rt, _) = with_input(
            Config {
                workspace: 2000,
                ..quiet()
            },
            b"",
        );

        rt.push_gc(Obj::NIL).unwrap();
        while rt.arena.free_count() > 20 {
            let rest = rt.arena.car(rt.gc_stack);
            let hoard = rt.arena.cons(Obj::NIL, rest).unwrap();
            rt.arena.set_car(rt.gc_stack, hoard);
        }

        let items: Vec<String> = (1..=80).map(|n| n.to_string()).collect();
        let code = format!("(length '({}))", items.join(" "));
        assert_eq!(fail(&mut rt, &code), "no room");

        rt.pop_gc();
        assert_eq!(run(&mut rt, &code), "80");
    }

    #[test]
    fn escapes() {
        let (mut rt, _) = with_input(quiet(), b"");

        rt.escape_handle().store(true, Ordering::Relaxed);
        assert_eq!(fail(&mut rt, "(+ 1 2)"), "Escape!");
        assert_eq!(run(&mut rt, "(+ 1 2)"), "3");
    }

    #[test]
    fn repl_transcript() {
        let (mut rt, out) = with_input(quiet(), b"(+ 1 2)\n(car 1)\n");

        rt.repl(Obj::NIL).unwrap();
        assert_eq!(
            String::from_utf8(out.borrow().clone()).unwrap(),
            "> \n3\n\n> \nError: 'car' can't take car: 1\n> "
        );
    }

    #[test]
    fn repl_prompt_shows_free_space() {
        let (mut rt, out) = with_input(
            Config {
                load_library: false,
                ..Config::default()
            },
            b"",
        );

        rt.repl(Obj::NIL).unwrap();
        // only t is allocated
        assert_eq!(&*out.borrow(), b"7999> ");
    }

    #[test]
    fn breaks() {
        let (mut rt, out) = with_input(quiet(), b"(+ 1 (break))\nx\nnil\n(+ 2 2)\n");

        rt.repl(Obj::NIL).unwrap();
        let text = String::from_utf8(out.borrow().clone()).unwrap();
        assert!(text.contains("\nBreak!\n : 1> "));
        assert!(text.contains("Error: undefined: x\n : 1> "));
        assert!(text.contains("'+' argument is not a number: nil"));
        assert!(text.ends_with("4\n\n> "));
        assert_eq!(rt.break_level, 0);
    }

    #[test]
    fn library() {
        assert_eq!(
            interpret("(filter (lambda (x) (> x 2)) '(1 2 3 4))").unwrap(),
            "(3 4)"
        );
        assert_eq!(interpret("(take 2 '(a b c))").unwrap(), "(a b)");
        assert_eq!(interpret("(drop 2 '(a b c))").unwrap(), "(c)");
        assert_eq!(interpret("(reduce + 0 '(1 2 3))").unwrap(), "6");
        assert_eq!(interpret("(every evenp '(2 4))").unwrap(), "t");
        assert_eq!(interpret("(some oddp '(2 4))").unwrap(), "nil");
        assert_eq!(interpret("(last '(1 2 3))").unwrap(), "3");

        let (mut rt, _) = with_input(quiet(), b"");
        assert_eq!(fail(&mut rt, "(last '(1 2 3))"), "undefined: last");
        assert_eq!(run(&mut rt, "(require 'last)"), "t");
        assert_eq!(run(&mut rt, "(last '(1 2 3))"), "3");
        assert_eq!(run(&mut rt, "(require 'last)"), "nil");
        assert_eq!(run(&mut rt, "(require 'bogus)"), "nil");
    }

    #[test]
    fn serial_port() {
        let (mut rt, _) = with_input(quiet(), b"");
        let (port, written) = BufferPort::new(b"line one\nmore");
        rt.register_port(Kind::Serial, 1, Box::new(port));

        assert_eq!(
            run(&mut rt, "(with-serial (s 1) (princ \"hi\" s) (read-line s))"),
            "\"line one\""
        );
        assert_eq!(&*written.borrow(), b"hi");
        assert_eq!(
            fail(&mut rt, "(with-serial (s 7) s)"),
            "'with-serial' port not supported: 7"
        );
    }

    #[test]
    fn runs_files() {
        let path = std::env::temp_dir().join(format!("kestrel-run-{}.lisp", std::process::id()));
        fs::write(&path, "(defvar x 20)\n; comment\n(+ x 22)\n").unwrap();

        let (mut rt, _) = with_input(quiet(), b"");
        assert_eq!(rt.run_file(&path).unwrap(), "42");

        fs::remove_file(&path).unwrap();
    }
}
