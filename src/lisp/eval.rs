// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/eval.rs

// The evaluator. Tail positions loop in place rather than recursing,
// so tail-recursive Lisp code runs in bounded native stack.

// <>

use super::{
    core::{Obj, SymId},
    printer::pint,
    stdenv::{Builtin, Handler, NativeFn, BUILTINS},
    stream::CONSOLE,
    LispErr, Runtime,
};

use std::sync::atomic::Ordering;

/// Functions that may be traced at once
pub const TRACEMAX: usize = 3;

/// Maximum arity meaning any number of arguments
pub const UNBOUNDED: u8 = 127;

/// Outcome of a tail-capable step
pub enum Step {
    /// A form still to be evaluated in the current environment
    Tail(Obj),
    /// A finished value
    Done(Obj),
}

/// An assignable location
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Place {
    Car(Obj),
    Cdr(Obj),
}

fn indent(out: &mut Vec<u8>, n: u32) {
    out.extend(std::iter::repeat(b' ').take(n as usize));
}

impl Runtime {
    /// Evaluates a form in an environment
    pub fn eval(&mut self, form: Obj, env: Obj) -> Result<Obj, LispErr> {
        self.depth += 1;
        if self.depth > self.config.max_depth {
            self.depth -= 1;
            return Err(self.err(None, "Stack overflow"));
        }

        if self.depth > self.max_seen_depth {
            self.max_seen_depth = self.depth;
            #[cfg(feature = "stkdbg")]
            {
                log::debug!("evaluation depth reached {}", self.depth);
            }
        }

        // the frame keeps this evaluation's form and environment alive
        // through collections started further in; atoms never allocate
        let framed = self.arena.consp(form);
        if framed {
            if let Err(e) = self.reserve(2, &[form, env]) {
                self.depth -= 1;
                return Err(e);
            }
            self.push_gc(form)?;
            self.push_gc(env)?;
        }

        let result = self.eval_loop(form, env);
        self.depth -= 1;
        if framed && result.is_ok() {
            self.pop_gc();
            self.pop_gc();
        }
        result
    }

    /// Points the innermost frame at the current form and environment
    fn reframe(&mut self, form: Obj, env: Obj) {
        self.arena.set_car(self.gc_stack, env);
        let below = self.arena.cdr(self.gc_stack);
        self.arena.set_car(below, form);
    }

    fn eval_loop(&mut self, mut form: Obj, mut env: Obj) -> Result<Obj, LispErr> {
        let mut tc = false;

        loop {
            if self.arena.consp(form) {
                self.reframe(form, env);
            }
            if self.arena.free_count() <= self.arena.capacity() >> 4 {
                self.gc(form, env);
            }

            self.test_escape()?;

            if self.arena.atom(form) {
                return match self.arena.sym(form) {
                    Some(id) => self.lookup(form, id, env),
                    None => Ok(form),
                };
            }

            let function = self.arena.car(form);
            let args = self.arena.cdr(form);

            if function.is_nil() {
                return Err(self.err_obj(None, "illegal function", Obj::NIL));
            }
            if !self.arena.listp(args) {
                return Err(self.err_obj(None, "can't evaluate a dotted pair", args));
            }

            if let Some(name) = self.arena.sym(function) {
                if name == Builtin::Let.id() || name == Builtin::LetStar.id() {
                    env = self.bind_let(name, args, env)?;
                    match self.progn(self.arena.cdr(args), env)? {
                        Step::Done(value) => return Ok(value),
                        Step::Tail(next) => {
                            form = next;
                            continue;
                        }
                    }
                }

                if name == Builtin::Lambda.id() {
                    return self.capture(form, args, env);
                }

                if name < Builtin::SpecialForms.id() {
                    return Err(self.err(name, "can't be used as a function"));
                }

                if let Some(entry) = BUILTINS.get(name as usize) {
                    match entry.func {
                        Handler::Special(f) => {
                            self.check_arity(name, args)?;
                            return f(self, args, env);
                        }
                        Handler::Tail(f) => {
                            self.check_arity(name, args)?;
                            match f(self, args, env)? {
                                Step::Done(value) => return Ok(value),
                                Step::Tail(next) => {
                                    form = next;
                                    tc = true;
                                    continue;
                                }
                            }
                        }
                        Handler::Func(_) | Handler::None => (),
                    }
                }
            }

            // an ordinary call: evaluate the head and every argument
            let fname = function;
            let tcstart = tc;

            let function = self.eval(fname, env)?;
            let head = self.arena.cons(function, Obj::NIL)?;
            self.push_gc(head)?;

            let mut tail = head;
            let mut rest = args;
            while !rest.is_nil() {
                if !self.arena.consp(rest) {
                    return Err(self.err_obj(None, "can't evaluate a dotted pair", rest));
                }
                let value = self.eval(self.arena.car(rest), env)?;
                let cell = self.arena.cons(value, Obj::NIL)?;
                self.arena.set_cdr(tail, cell);
                tail = cell;
                rest = self.arena.cdr(rest);
            }

            let args = self.arena.cdr(head);

            if let Some(name) = self.arena.sym(function) {
                let f = self.native(name, fname)?;
                self.check_arity(name, args)?;
                if self.arena.free_count() <= self.arena.capacity() >> 4 {
                    self.gc(form, env);
                }
                let result = f(self, args, env)?;
                self.pop_gc();
                return Ok(result);
            }

            let (state, body) = match self.callable(function) {
                Some(parts) => parts,
                None => return Err(self.err_obj(None, "illegal function", fname)),
            };

            let name = self.arena.sym(fname);
            let step = self.closure(tcstart, name, state, body, args, &mut env)?;
            self.pop_gc();

            if let Some(slot) = name.and_then(|n| self.tracing(n)) {
                let result = self.finish(step, env)?;
                self.trace_depth[slot] = self.trace_depth[slot].saturating_sub(1);

                let mut line = Vec::new();
                indent(&mut line, self.trace_depth[slot] << 1);
                pint(&mut line, self.trace_depth[slot] as i32);
                line.extend_from_slice(b": ");
                self.print_object(&mut line, fname, true);
                line.extend_from_slice(b" returned ");
                self.print_object(&mut line, result, true);
                line.push(b'\n');
                self.ports.write(CONSOLE, &line)?;

                return Ok(result);
            }

            match step {
                Step::Done(value) => return Ok(value),
                Step::Tail(next) => {
                    form = next;
                    tc = true;
                }
            }
        }
    }

    /// Fails once if the escape handle has been raised
    pub(crate) fn test_escape(&self) -> Result<(), LispErr> {
        if !self.no_esc && self.escape.swap(false, Ordering::Relaxed) {
            return Err(self.err(None, "Escape!"));
        }
        Ok(())
    }

    fn lookup(&self, form: Obj, id: SymId, env: Obj) -> Result<Obj, LispErr> {
        if id == Builtin::Nil.id() {
            return Ok(Obj::NIL);
        }

        match self.value(id, env).or_else(|| self.value(id, self.global_env)) {
            Some(pair) => Ok(self.arena.cdr(pair)),
            // builtins name themselves
            None if id < Builtin::EndFunctions.id() => Ok(form),
            None => Err(self.err_obj(None, "undefined", form)),
        }
    }

    /// Binding pair for a symbol in an association list
    pub(crate) fn value(&self, id: SymId, mut env: Obj) -> Option<Obj> {
        while !env.is_nil() {
            let pair = self.arena.car(env);
            if !pair.is_nil() && self.arena.sym(self.arena.car(pair)) == Some(id) {
                return Some(pair);
            }
            env = self.arena.cdr(env);
        }
        None
    }

    /// Binding pair for a variable, local first, then global
    pub(crate) fn findvalue(&self, var: Obj, env: Obj) -> Result<Obj, LispErr> {
        self.arena
            .sym(var)
            .and_then(|id| self.value(id, env).or_else(|| self.value(id, self.global_env)))
            .ok_or_else(|| self.err_obj(None, "unknown variable", var))
    }

    fn bind_let(&mut self, name: SymId, args: Obj, mut env: Obj) -> Result<Obj, LispErr> {
        let mut assigns = self.arena.car(args);
        if !self.arena.listp(assigns) {
            return Err(self.err_obj(name, "first argument is not a list", assigns));
        }

        let sequential = name == Builtin::LetStar.id();
        let mut newenv = env;
        self.push_gc(newenv)?;

        while !assigns.is_nil() {
            let assign = self.arena.car(assigns);
            let (var, value) = if !self.arena.consp(assign) {
                (assign, Obj::NIL)
            } else if self.arena.cdr(assign).is_nil() {
                (self.arena.car(assign), Obj::NIL)
            } else {
                let value = self.eval(self.arena.second(assign), env)?;
                (self.arena.car(assign), value)
            };

            let pair = self.arena.cons(var, value)?;
            newenv = self.arena.cons(pair, newenv)?;
            self.arena.set_car(self.gc_stack, newenv);
            if sequential {
                env = newenv;
            }
            assigns = self.arena.cdr(assigns);
        }

        self.pop_gc();
        Ok(newenv)
    }

    /// A lambda evaluated in a non-empty environment becomes a closure
    /// over the bindings visible at that point
    fn capture(&mut self, form: Obj, args: Obj, mut env: Obj) -> Result<Obj, LispErr> {
        if env.is_nil() {
            return Ok(form);
        }

        let mut envcopy = Obj::NIL;
        while !env.is_nil() {
            let pair = self.arena.car(env);
            if !pair.is_nil() {
                envcopy = self.arena.cons(pair, envcopy)?;
            }
            env = self.arena.cdr(env);
        }

        let body = self.arena.cons(envcopy, args)?;
        let tag = self.arena.symbol(Builtin::Closure.id())?;
        self.arena.cons(tag, body)
    }

    /// Captured state and (params . body) of a lambda or closure
    pub(crate) fn callable(&self, function: Obj) -> Option<(Obj, Obj)> {
        if !self.arena.consp(function) {
            return None;
        }

        let tag = self.arena.car(function);
        let rest = self.arena.cdr(function);

        if self.arena.is_sym(tag, Builtin::Lambda.id()) {
            Some((Obj::NIL, rest))
        } else if self.arena.is_sym(tag, Builtin::Closure.id()) {
            Some((self.arena.car(rest), self.arena.cdr(rest)))
        } else {
            None
        }
    }

    /// Binds a function's parameters onto the environment and returns
    /// its body as a step
    ///
    /// In tail position the previous frame is dropped back to its nil
    /// marker, so tail recursion does not grow the environment.
    pub(crate) fn closure(
        &mut self,
        tc: bool,
        name: Option<SymId>,
        mut state: Obj,
        function: Obj,
        mut args: Obj,
        env: &mut Obj,
    ) -> Result<Step, LispErr> {
        let trace = name.and_then(|n| self.tracing(n));
        let mut line = Vec::new();

        if let (Some(slot), Some(id)) = (trace, name) {
            indent(&mut line, self.trace_depth[slot] << 1);
            pint(&mut line, self.trace_depth[slot] as i32);
            line.extend_from_slice(b": (");
            line.extend_from_slice(&self.symtab.name(id).unwrap_or_default());
            self.trace_depth[slot] += 1;
        }

        let mut params = self.arena.car(function);
        let body = self.arena.cdr(function);

        if tc {
            if !env.is_nil() && self.arena.car(*env).is_nil() {
                *env = self.arena.cdr(*env);
                while !env.is_nil() && !self.arena.car(*env).is_nil() {
                    *env = self.arena.cdr(*env);
                }
            } else {
                *env = self.arena.cons(Obj::NIL, *env)?;
            }
        }

        while !state.is_nil() {
            *env = self.arena.cons(self.arena.car(state), *env)?;
            state = self.arena.cdr(state);
        }

        let mut optional = false;
        while !params.is_nil() {
            let mut var = self.arena.car(params);

            if self.arena.is_sym(var, Builtin::AmpOptional.id()) {
                optional = true;
                params = self.arena.cdr(params);
                continue;
            }

            let value;
            if self.arena.consp(var) {
                if !optional {
                    return Err(self.err_obj(name, "invalid default value", var));
                }
                if args.is_nil() {
                    value = self.eval(self.arena.second(var), *env)?;
                } else {
                    value = self.arena.car(args);
                    args = self.arena.cdr(args);
                }
                var = self.arena.car(var);
                if !self.arena.symbolp(var) {
                    return Err(self.err_obj(name, "illegal optional parameter", var));
                }
            } else if !self.arena.symbolp(var) {
                return Err(self.err(name, "illegal parameter"));
            } else if self.arena.is_sym(var, Builtin::AmpRest.id()) {
                params = self.arena.cdr(params);
                var = self.arena.car(params);
                value = args;
                args = Obj::NIL;
            } else if args.is_nil() {
                if !optional {
                    return Err(match name {
                        Some(_) => self.err(name, "has too few arguments"),
                        None => self.err(None, "function has too few arguments"),
                    });
                }
                value = Obj::NIL;
            } else {
                value = self.arena.car(args);
                args = self.arena.cdr(args);
            }

            let pair = self.arena.cons(var, value)?;
            *env = self.arena.cons(pair, *env)?;

            if trace.is_some() {
                line.push(b' ');
                self.print_object(&mut line, value, true);
            }

            params = self.arena.cdr(params);
        }

        if !args.is_nil() {
            return Err(match name {
                Some(_) => self.err(name, "has too many arguments"),
                None => self.err(None, "function has too many arguments"),
            });
        }

        if trace.is_some() {
            line.extend_from_slice(b")\n");
            self.ports.write(CONSOLE, &line)?;
        }

        if tc {
            *env = self.arena.cons(Obj::NIL, *env)?;
        }

        self.progn(body, *env)
    }

    /// Calls a function value on an already evaluated argument list
    pub(crate) fn apply(
        &mut self,
        name: SymId,
        function: Obj,
        args: Obj,
        mut env: Obj,
    ) -> Result<Obj, LispErr> {
        if let Some(fname) = self.arena.sym(function) {
            let f = self.native(fname, function)?;
            self.check_arity(fname, args)?;
            return f(self, args, env);
        }

        match self.callable(function) {
            Some((state, body)) => {
                let step = self.closure(false, None, state, body, args, &mut env)?;
                self.finish(step, env)
            }
            None => Err(self.err_obj(name, "illegal function", function)),
        }
    }

    /// Completes a step, evaluating a pending tail form
    pub(crate) fn finish(&mut self, step: Step, env: Obj) -> Result<Obj, LispErr> {
        match step {
            Step::Tail(form) => self.eval(form, env),
            Step::Done(value) => Ok(value),
        }
    }

    /// The native handler behind an ordinary builtin function
    fn native(&self, name: SymId, fname: Obj) -> Result<NativeFn, LispErr> {
        match BUILTINS.get(name as usize).map(|e| e.func) {
            Some(Handler::Func(f)) => Ok(f),
            _ => Err(self.err_obj(None, "not valid here", fname)),
        }
    }

    /// Length of a proper list
    pub(crate) fn listlength(&self, name: SymId, mut list: Obj) -> Result<usize, LispErr> {
        let mut length = 0;
        while !list.is_nil() {
            if self.arena.improperp(list) {
                return Err(self.err(name, "argument is not a proper list"));
            }
            list = self.arena.cdr(list);
            length += 1;
        }
        Ok(length)
    }

    /// Checks an argument list against a builtin's arity
    pub(crate) fn check_arity(&self, name: SymId, args: Obj) -> Result<(), LispErr> {
        let nargs = self.listlength(name, args)?;
        let entry = match BUILTINS.get(name as usize) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        if nargs < entry.min as usize {
            return Err(self.err(name, "has too few arguments"));
        }
        if entry.max != UNBOUNDED && nargs > entry.max as usize {
            return Err(self.err(name, "has too many arguments"));
        }
        Ok(())
    }

    /// Trace slot of a function, if it is being traced
    pub(crate) fn tracing(&self, name: SymId) -> Option<usize> {
        if name == 0 {
            return None;
        }
        self.trace_fn.iter().position(|&t| t == name)
    }

    /// Resolves an assignable location, evaluating its container
    pub(crate) fn place(&mut self, name: SymId, args: Obj, env: Obj) -> Result<Place, LispErr> {
        if self.arena.atom(args) {
            return Ok(Place::Cdr(self.findvalue(args, env)?));
        }

        let head = self.arena.sym(self.arena.car(args)).unwrap_or(0);
        let is = |b: Builtin| head == b.id();

        if is(Builtin::Car) || is(Builtin::First) {
            let value = self.eval(self.arena.second(args), env)?;
            if !self.arena.consp(value) {
                return Err(self.err_obj(name, "can't take car", value));
            }
            return Ok(Place::Car(value));
        }

        if is(Builtin::Cdr) || is(Builtin::Rest) {
            let value = self.eval(self.arena.second(args), env)?;
            if !self.arena.consp(value) {
                return Err(self.err_obj(name, "can't take cdr", value));
            }
            return Ok(Place::Cdr(value));
        }

        if is(Builtin::Nth) {
            let index = self.eval(self.arena.second(args), env)?;
            let mut index = self.checkinteger(Builtin::Nth.id(), index)?;
            let mut list = self.eval(self.arena.third(args), env)?;
            if self.arena.atom(list) {
                return Err(self.err_obj(name, "second argument to nth is not a list", list));
            }
            while index > 0 {
                list = self.arena.cdr(list);
                if self.arena.atom(list) {
                    return Err(self.err(name, "index to nth is out of range"));
                }
                index -= 1;
            }
            return Ok(Place::Car(list));
        }

        Err(self.err(name, "illegal place"))
    }

    pub(crate) fn place_get(&self, place: Place) -> Obj {
        match place {
            Place::Car(cell) => self.arena.car(cell),
            Place::Cdr(cell) => self.arena.cdr(cell),
        }
    }

    pub(crate) fn place_set(&mut self, place: Place, value: Obj) {
        match place {
            Place::Car(cell) => self.arena.set_car(cell, value),
            Place::Cdr(cell) => self.arena.set_cdr(cell, value),
        }
    }

    /// The cell a place lives in, for protecting it from collection
    pub(crate) fn place_cell(place: Place) -> Obj {
        match place {
            Place::Car(cell) | Place::Cdr(cell) => cell,
        }
    }
}
